//! Event pump: blocking wait, classification and listener fan-out
//!
//! Runs on the watcher's worker thread. Each iteration blocks in
//! [`WatchService::take`], dispatches every event of the batch to all
//! listeners, then re-arms the batch's key. A raised stop flag ends dispatch
//! at the next listener call, even in the middle of a batch.

use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::listeners::ListenerRegistry;
use crate::traits::{
    DirListener, WatchBatch, WatchEvent, WatchEventKind, WatchKey, WatchService,
    WatchServiceError,
};

/// Registered directories by key. Keys are removed once reset reports them invalid.
pub type Registrations = Arc<Mutex<BTreeMap<WatchKey, PathBuf>>>;

/// Directory entries known to exist, so a later delete can be classified
/// after the entry itself is gone.
#[derive(Debug, Default)]
pub struct DirectoryIndex {
    dirs: Mutex<HashSet<PathBuf>>,
}

impl DirectoryIndex {
    pub fn new(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            dirs: Mutex::new(dirs.into_iter().collect()),
        }
    }

    pub fn insert(&self, path: PathBuf) {
        self.dirs.lock().unwrap().insert(path);
    }

    /// Forget `path`, returning whether it was a known directory.
    pub fn take(&self, path: &Path) -> bool {
        self.dirs.lock().unwrap().remove(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }
}

/// State shared between a [`DirWatcher`](crate::DirWatcher) and its worker.
pub struct Pump {
    pub service: Arc<dyn WatchService>,
    pub registrations: Registrations,
    pub listeners: Arc<ListenerRegistry>,
    pub directories: Arc<DirectoryIndex>,
}

impl Pump {
    /// Loop until `stop` is raised, the service closes, or no registration is left.
    pub fn run(&self, stop: &AtomicBool) {
        tracing::debug!("Event pump started");

        while !stop.load(Ordering::SeqCst) {
            if self.registrations.lock().unwrap().is_empty() {
                tracing::info!("No valid registrations left, event pump exiting");
                break;
            }

            let batch = match self.service.take() {
                Ok(batch) => batch,
                Err(WatchServiceError::Interrupted) => {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    // Leftover wakeup from an earlier stop.
                    continue;
                }
                Err(WatchServiceError::Closed) => {
                    tracing::debug!("Watch service closed, event pump exiting");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Watch service wait failed, event pump exiting");
                    break;
                }
            };

            self.process_batch(&batch, stop);
        }

        tracing::debug!("Event pump stopped");
    }

    /// Dispatch one batch and re-arm its key. Events left after `stop` is
    /// raised are dropped, but the key is still re-armed.
    pub fn process_batch(&self, batch: &WatchBatch, stop: &AtomicBool) {
        let dir = match self.registrations.lock().unwrap().get(&batch.key) {
            Some(dir) => dir.clone(),
            None => {
                tracing::debug!(key = batch.key.0, "Batch for unknown registration, skipping");
                return;
            }
        };

        for (index, event) in batch.events.iter().enumerate() {
            if stop.load(Ordering::SeqCst) {
                tracing::debug!(
                    key = batch.key.0,
                    skipped = batch.events.len() - index,
                    "Stop requested, dropping rest of batch"
                );
                break;
            }
            self.dispatch(&dir, event, stop);
        }

        if !self.service.reset(batch.key) {
            tracing::warn!(
                key = batch.key.0,
                dir = %dir.display(),
                "Registration no longer valid, dropping it"
            );
            self.registrations.lock().unwrap().remove(&batch.key);
            // The parent may still report this directory's deletion.
            self.directories.insert(dir);
        }
    }

    fn dispatch(&self, dir: &Path, event: &WatchEvent, stop: &AtomicBool) {
        let listeners = self.listeners.snapshot();

        let context = match (event.kind, event.context.as_deref()) {
            (WatchEventKind::Overflow, _) => {
                tracing::warn!(dir = %dir.display(), "Watch service overflow, events were lost");
                notify_all(&listeners, stop, |l| l.on_overflow(event));
                return;
            }
            (_, Some(context)) => context,
            (kind, None) => {
                tracing::debug!(?kind, "Event without a path, skipping");
                return;
            }
        };
        let full_path = dir.join(context);
        tracing::debug!(kind = ?event.kind, path = %full_path.display(), "Dispatching event");

        match event.kind {
            WatchEventKind::Create => {
                if full_path.is_dir() {
                    self.directories.insert(full_path);
                }
                notify_all(&listeners, stop, |l| l.on_create(event));
            }
            WatchEventKind::Modify => {
                notify_all(&listeners, stop, |l| l.on_modify(event));
            }
            WatchEventKind::Delete => {
                let is_directory = self.was_directory(&full_path);
                notify_all(&listeners, stop, |l| l.on_delete(event, is_directory));
            }
            WatchEventKind::Overflow => unreachable!("handled above"),
        }
    }

    fn was_directory(&self, path: &Path) -> bool {
        let known = self.directories.take(path);
        let registered = self
            .registrations
            .lock()
            .unwrap()
            .values()
            .any(|dir| dir == path);
        known || registered
    }
}

/// Invoke `f` for each listener until `stop` is raised, isolating panics so
/// one faulty listener cannot starve the others or kill the pump.
fn notify_all(
    listeners: &[Arc<dyn DirListener>],
    stop: &AtomicBool,
    f: impl Fn(&dyn DirListener),
) {
    for listener in listeners {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(listener.as_ref())));
        if let Err(payload) = result {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::warn!(panic = %message, "Listener panicked during dispatch");
        }
    }
}

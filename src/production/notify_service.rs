//! `notify`-backed watch service
//!
//! Every registration is a non-recursive OS watch. The `notify` callback thread
//! translates raw events into per-registration batches and pushes them into a
//! bounded queue; `take()` pops from that queue. A full queue drops events and
//! is reported as a single overflow on the next `take()`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::config::ServiceConfig;
use crate::traits::{
    WatchBatch, WatchEvent, WatchEventKind, WatchKey, WatchPlatform, WatchService,
    WatchServiceError,
};

/// How long a deleted registered directory swallows its duplicate removal.
const RETIRED_WINDOW: Duration = Duration::from_secs(1);

enum Signal {
    Batch(WatchBatch),
    Wakeup,
    Closed,
}

/// Directory → key routing shared with the `notify` callback thread
#[derive(Default)]
struct Routes {
    by_path: HashMap<PathBuf, WatchKey>,
    invalid: HashSet<WatchKey>,
    retired: HashMap<PathBuf, Instant>,
    next_key: u64,
}

impl Routes {
    fn register(&mut self, dir: &Path) -> WatchKey {
        if let Some(key) = self.by_path.get(dir) {
            return *key;
        }
        self.next_key += 1;
        let key = WatchKey(self.next_key);
        self.by_path.insert(dir.to_path_buf(), key);
        key
    }

    fn live_key(&self, dir: &Path) -> Option<WatchKey> {
        self.by_path
            .get(dir)
            .copied()
            .filter(|key| !self.invalid.contains(key))
    }

    /// Overflow goes to the oldest registration that is still valid.
    fn overflow_batch(&self) -> Option<WatchBatch> {
        let key = self
            .by_path
            .values()
            .filter(|key| !self.invalid.contains(key))
            .min()
            .copied()?;
        Some(WatchBatch {
            key,
            events: vec![WatchEvent::overflow()],
        })
    }

    /// Translate one `notify` event into batches, in delivery order.
    fn translate(&mut self, event: &Event) -> Vec<WatchBatch> {
        if event.need_rescan() {
            return self.overflow_batch().into_iter().collect();
        }

        let changes: Vec<(WatchEventKind, &PathBuf)> = match &event.kind {
            EventKind::Create(_) => tag(WatchEventKind::Create, &event.paths),
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                tag(WatchEventKind::Delete, &event.paths)
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                tag(WatchEventKind::Create, &event.paths)
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                vec![
                    (WatchEventKind::Delete, &event.paths[0]),
                    (WatchEventKind::Create, &event.paths[1]),
                ]
            }
            EventKind::Modify(ModifyKind::Name(_)) => event
                .paths
                .iter()
                .map(|p| {
                    let kind = if p.exists() {
                        WatchEventKind::Create
                    } else {
                        WatchEventKind::Delete
                    };
                    (kind, p)
                })
                .collect(),
            EventKind::Modify(_) => tag(WatchEventKind::Modify, &event.paths),
            EventKind::Remove(_) => tag(WatchEventKind::Delete, &event.paths),
            EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
        };

        let mut batches: Vec<WatchBatch> = Vec::new();
        for (kind, path) in changes {
            if kind == WatchEventKind::Delete && !self.retire(path, &mut batches) {
                continue;
            }
            let Some(key) = path.parent().and_then(|parent| self.live_key(parent)) else {
                tracing::trace!(path = %path.display(), "Event outside any registration");
                continue;
            };
            let Some(name) = path.file_name() else {
                continue;
            };
            let event = WatchEvent::new(kind, name);
            match batches.last_mut() {
                Some(batch) if batch.key == key => batch.events.push(event),
                _ => batches.push(WatchBatch {
                    key,
                    events: vec![event],
                }),
            }
        }
        batches
    }

    /// Handle the removal of a registered directory: invalidate its key and
    /// queue an empty batch so the consumer notices on reset. Returns false
    /// when the delete is a duplicate that must not be reported again.
    fn retire(&mut self, path: &Path, batches: &mut Vec<WatchBatch>) -> bool {
        let now = Instant::now();
        self.retired
            .retain(|_, at| now.duration_since(*at) < RETIRED_WINDOW);

        if self.retired.remove(path).is_some() {
            return false;
        }
        if let Some(key) = self.live_key(path) {
            self.invalid.insert(key);
            self.retired.insert(path.to_path_buf(), now);
            batches.push(WatchBatch {
                key,
                events: Vec::new(),
            });
        }
        true
    }
}

fn tag(kind: WatchEventKind, paths: &[PathBuf]) -> Vec<(WatchEventKind, &PathBuf)> {
    paths.iter().map(|p| (kind, p)).collect()
}

struct Shared {
    routes: Mutex<Routes>,
    overflowed: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    fn handle(&self, tx: &SyncSender<Signal>, result: notify::Result<Event>) {
        let event = match result {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Watch backend error, reporting overflow");
                self.overflowed.store(true, Ordering::SeqCst);
                return;
            }
        };
        tracing::trace!(?event, "Raw notify event");

        let batches = self.routes.lock().unwrap().translate(&event);
        for batch in batches {
            match tx.try_send(Signal::Batch(batch)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.overflowed.store(true, Ordering::SeqCst);
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

pub struct NotifyWatchService {
    watcher: Mutex<Option<RecommendedWatcher>>,
    shared: Arc<Shared>,
    tx: SyncSender<Signal>,
    rx: Mutex<Receiver<Signal>>,
}

impl NotifyWatchService {
    pub fn new(config: &ServiceConfig) -> Result<Self, WatchServiceError> {
        let (tx, rx) = mpsc::sync_channel(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            routes: Mutex::new(Routes::default()),
            overflowed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let callback_shared = Arc::clone(&shared);
        let callback_tx = tx.clone();
        let watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            callback_shared.handle(&callback_tx, result);
        })
        .map_err(|e| WatchServiceError::Io(e.to_string()))?;

        tracing::debug!(queue_capacity = config.queue_capacity, "Opened notify watch service");

        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
            shared,
            tx,
            rx: Mutex::new(rx),
        })
    }
}

impl WatchService for NotifyWatchService {
    fn register(&self, dir: &Path) -> Result<WatchKey, WatchServiceError> {
        let mut watcher = self.watcher.lock().unwrap();
        let watcher = watcher.as_mut().ok_or(WatchServiceError::Closed)?;

        if let Some(key) = self.shared.routes.lock().unwrap().live_key(dir) {
            return Ok(key);
        }
        if !dir.is_dir() {
            return Err(WatchServiceError::Unsupported(dir.to_path_buf()));
        }
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatchServiceError::Io(format!("{}: {}", dir.display(), e)))?;

        let key = self.shared.routes.lock().unwrap().register(dir);
        tracing::debug!(key = key.0, dir = %dir.display(), "Registered directory");
        Ok(key)
    }

    fn take(&self) -> Result<WatchBatch, WatchServiceError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(WatchServiceError::Closed);
        }
        if self.shared.overflowed.swap(false, Ordering::SeqCst) {
            if let Some(batch) = self.shared.routes.lock().unwrap().overflow_batch() {
                return Ok(batch);
            }
        }

        let rx = self.rx.lock().unwrap();
        match rx.recv() {
            Ok(Signal::Batch(batch)) => Ok(batch),
            Ok(Signal::Wakeup) => Err(WatchServiceError::Interrupted),
            Ok(Signal::Closed) | Err(_) => Err(WatchServiceError::Closed),
        }
    }

    fn reset(&self, key: WatchKey) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
            && !self.shared.routes.lock().unwrap().invalid.contains(&key)
    }

    fn wakeup(&self) {
        // A full queue means take() will not block, so a dropped wakeup is fine.
        let _ = self.tx.try_send(Signal::Wakeup);
    }

    fn close(&self) -> Result<(), WatchServiceError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Dropping the OS watcher removes every watch and joins its thread.
        drop(self.watcher.lock().unwrap().take());
        let _ = self.tx.try_send(Signal::Closed);
        tracing::debug!("Closed notify watch service");
        Ok(())
    }
}

/// Immediate subdirectories of `dir`, sorted. Symlinks are not followed.
pub fn read_subdirectories(dir: &Path) -> Result<Vec<PathBuf>, WatchServiceError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| WatchServiceError::Io(format!("{}: {}", dir.display(), e)))?;

    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| WatchServiceError::Io(e.to_string()))?;
        let file_type = entry
            .file_type()
            .map_err(|e| WatchServiceError::Io(e.to_string()))?;
        if file_type.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Default host platform: `notify` for events, `std::fs` for listings
#[derive(Debug, Clone, Default)]
pub struct NotifyPlatform {
    config: ServiceConfig,
}

impl NotifyPlatform {
    pub fn new(config: ServiceConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(ServiceConfig::from_env())
    }
}

impl WatchPlatform for NotifyPlatform {
    fn open_watch_service(&self) -> Result<Arc<dyn WatchService>, WatchServiceError> {
        Ok(Arc::new(NotifyWatchService::new(&self.config)?))
    }

    fn list_subdirectories(&self, dir: &Path) -> Result<Vec<PathBuf>, WatchServiceError> {
        read_subdirectories(dir)
    }
}

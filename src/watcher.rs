//! DirWatcher - lifecycle owner for a watched directory tree
//!
//! Registers the root directory and its immediate subdirectories with a
//! platform watch service, runs the event pump on a dedicated thread, and
//! guards start/stop/close so they are safe from any thread.
//!
//! Subdirectories created after construction are not registered. Their own
//! creation and deletion is still reported through the parent registration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use crate::listeners::ListenerRegistry;
use crate::production::NotifyPlatform;
use crate::pump::{DirectoryIndex, Pump};
use crate::traits::{DirListener, WatchKey, WatchPlatform, WatchService, WatchServiceError};

#[derive(Debug, thiserror::Error)]
pub enum DirWatcherError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Initialization failed: {message}")]
    InitializationError {
        message: &'static str,
        #[source]
        source: WatchServiceError,
    },
    #[error("Illegal state: {message}")]
    IllegalState {
        message: &'static str,
        #[source]
        source: Option<WatchServiceError>,
    },
}

impl DirWatcherError {
    fn init(message: &'static str) -> impl FnOnce(WatchServiceError) -> Self {
        move |source| Self::InitializationError { message, source }
    }

    fn illegal(message: &'static str) -> Self {
        Self::IllegalState {
            message,
            source: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WatcherState {
    Created,
    Started,
    Stopped,
    Closed,
}

impl WatcherState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Started,
            2 => Self::Stopped,
            _ => Self::Closed,
        }
    }
}

const STARTED: u8 = WatcherState::Started as u8;
const STOPPED: u8 = WatcherState::Stopped as u8;

struct Worker {
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
}

#[derive(Default)]
struct Lifecycle {
    worker: Option<Worker>,
    /// Pump threads told to stop but not joined yet.
    retired: Vec<JoinHandle<()>>,
    /// Pump threads some caller is joining with the lock released.
    joining: Vec<ThreadId>,
}

/// Watches a directory and its pre-existing subdirectories.
///
/// Dropping the watcher closes it.
pub struct DirWatcher {
    root: PathBuf,
    pump: Arc<Pump>,
    state: Arc<AtomicU8>,
    lifecycle: Mutex<Lifecycle>,
    joined: Condvar,
    closed: AtomicBool,
}

impl DirWatcher {
    /// Watch `path` using the OS notification backend.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, DirWatcherError> {
        Self::with_platform(path, &NotifyPlatform::from_env())
    }

    /// Watch `path` with an explicit platform implementation.
    pub fn with_platform(
        path: impl AsRef<Path>,
        platform: &dyn WatchPlatform,
    ) -> Result<Self, DirWatcherError> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(DirWatcherError::InvalidArgument(format!(
                "{} does not exist or is not a directory",
                path.display()
            )));
        }
        let root = std::fs::canonicalize(path).map_err(|e| {
            DirWatcherError::InvalidArgument(format!("{}: {}", path.display(), e))
        })?;

        let service = platform
            .open_watch_service()
            .map_err(DirWatcherError::init("could not create watch service"))?;

        let (registrations, known_dirs) = match register_tree(&root, platform, service.as_ref()) {
            Ok(registered) => registered,
            Err(e) => {
                if let Err(close_err) = service.close() {
                    tracing::warn!(error = %close_err, "Failed to release watch service after init error");
                }
                return Err(e);
            }
        };

        tracing::info!(
            root = %root.display(),
            registrations = registrations.len(),
            "Directory watcher created"
        );

        Ok(Self {
            root,
            pump: Arc::new(Pump {
                service,
                registrations: Arc::new(Mutex::new(registrations)),
                listeners: Arc::new(ListenerRegistry::new()),
                directories: Arc::new(DirectoryIndex::new(known_dirs)),
            }),
            state: Arc::new(AtomicU8::new(WatcherState::Created as u8)),
            lifecycle: Mutex::new(Lifecycle::default()),
            joined: Condvar::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Canonical path of the watched root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directories currently registered (root first, then subdirectories).
    pub fn registered_dirs(&self) -> Vec<PathBuf> {
        self.pump
            .registrations
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }

    /// Attach a listener. Adding the same listener twice has no effect.
    ///
    /// The watcher keeps only a weak reference; the caller owns the listener.
    pub fn add_listener(&self, listener: Weak<dyn DirListener>) -> Result<(), DirWatcherError> {
        if listener.strong_count() == 0 {
            return Err(DirWatcherError::InvalidArgument(
                "listener is null or already dropped".to_string(),
            ));
        }
        if self.pump.listeners.add(listener) {
            tracing::debug!(listeners = self.pump.listeners.len(), "Listener added");
        }
        Ok(())
    }

    /// Detach a listener. Returns whether it was registered.
    pub fn remove_listener(&self, listener: Weak<dyn DirListener>) -> Result<bool, DirWatcherError> {
        if listener.strong_count() == 0 {
            return Err(DirWatcherError::InvalidArgument(
                "listener is null or already dropped".to_string(),
            ));
        }
        Ok(self.pump.listeners.remove(&listener))
    }

    /// Spawn the event pump. Returns without waiting for it to start consuming.
    ///
    /// A pump that is still finishing a callback after being stopped is
    /// joined first, so at most one pump ever consumes events.
    pub fn start_watch(&self) -> Result<(), DirWatcherError> {
        let lifecycle = self.lifecycle.lock().unwrap();
        self.ensure_startable()?;
        let mut lifecycle = self.quiesce(lifecycle);
        self.ensure_startable()?;

        let previous = self.state.swap(STARTED, Ordering::SeqCst);
        let stop = Arc::new(AtomicBool::new(false));
        let pump = Arc::clone(&self.pump);
        let state = Arc::clone(&self.state);
        let worker_stop = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name("dirwatch-pump".to_string())
            .spawn(move || {
                pump.run(&worker_stop);
                if !worker_stop.load(Ordering::SeqCst) {
                    // Ran dry on its own; let a later start_watch spawn a new one.
                    let _ = state.compare_exchange(
                        STARTED,
                        STOPPED,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.state.store(previous, Ordering::SeqCst);
                return Err(DirWatcherError::IllegalState {
                    message: "could not spawn event pump",
                    source: Some(WatchServiceError::Io(e.to_string())),
                });
            }
        };

        lifecycle.worker = Some(Worker { handle, stop });
        tracing::info!(root = %self.root.display(), "Watching started");
        Ok(())
    }

    /// Stop the event pump and wait for it to exit. No-op when not started.
    ///
    /// No listener is called once this returns. The watch handle stays open,
    /// so `start_watch` can resume.
    pub fn stop_watch(&self) -> Result<(), DirWatcherError> {
        let lifecycle = self.lifecycle.lock().unwrap();
        if self.closed.load(Ordering::SeqCst) {
            return Err(DirWatcherError::illegal("closed"));
        }
        let idle = lifecycle.worker.is_none() && lifecycle.retired.is_empty();
        if self.state() != WatcherState::Started && idle {
            return Ok(());
        }
        // Also reaps a pump stopped from its own listener.
        let _lifecycle = self.quiesce(lifecycle);
        if self
            .state
            .compare_exchange(STARTED, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tracing::info!(root = %self.root.display(), "Watching stopped");
        }
        Ok(())
    }

    /// Stop the pump if running and release the watch handle.
    ///
    /// Only the first call does anything. If releasing the handle fails the
    /// error is returned, but the watcher is closed regardless.
    pub fn close(&self) -> Result<(), DirWatcherError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let lifecycle = self.lifecycle.lock().unwrap();
            let _lifecycle = self.quiesce(lifecycle);
            self.state.store(WatcherState::Closed as u8, Ordering::SeqCst);
        }

        self.pump
            .service
            .close()
            .map_err(|source| DirWatcherError::IllegalState {
                message: "error closing service",
                source: Some(source),
            })?;
        tracing::info!(root = %self.root.display(), "Watcher closed");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.state() == WatcherState::Started
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> WatcherState {
        if self.closed.load(Ordering::SeqCst) {
            return WatcherState::Closed;
        }
        WatcherState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn ensure_startable(&self) -> Result<(), DirWatcherError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DirWatcherError::illegal("closed"));
        }
        if self.state() == WatcherState::Started {
            return Err(DirWatcherError::illegal("already started"));
        }
        Ok(())
    }

    /// Signal the running pump to stop, then join every pump thread other
    /// than the calling one.
    ///
    /// The lock is released while joining, so listeners on those threads can
    /// still call into the watcher. Returns with the lock held again.
    fn quiesce<'a>(
        &'a self,
        mut lifecycle: MutexGuard<'a, Lifecycle>,
    ) -> MutexGuard<'a, Lifecycle> {
        let current = thread::current().id();
        loop {
            if lifecycle.joining.contains(&current) {
                // Called from a listener on a pump that another caller is joining.
                return lifecycle;
            }
            if lifecycle.joining.is_empty() {
                break;
            }
            lifecycle = self.joined.wait(lifecycle).unwrap();
        }

        if let Some(worker) = lifecycle.worker.take() {
            worker.stop.store(true, Ordering::SeqCst);
            self.pump.service.wakeup();
            lifecycle.retired.push(worker.handle);
        }

        let (own, others): (Vec<_>, Vec<_>) = lifecycle
            .retired
            .drain(..)
            .partition(|handle| handle.thread().id() == current);
        lifecycle.retired = own;
        if !lifecycle.retired.is_empty() {
            tracing::debug!("Stop requested from the pump thread, joining later");
        }
        if others.is_empty() {
            return lifecycle;
        }

        lifecycle.joining = others.iter().map(|handle| handle.thread().id()).collect();
        drop(lifecycle);
        for handle in others {
            if handle.join().is_err() {
                tracing::warn!("Event pump thread panicked");
            }
        }

        let mut lifecycle = self.lifecycle.lock().unwrap();
        lifecycle.joining.clear();
        self.joined.notify_all();
        lifecycle
    }
}

impl Drop for DirWatcher {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Error closing watcher on drop");
        }
    }
}

type Registered = (BTreeMap<WatchKey, PathBuf>, Vec<PathBuf>);

/// Register `root` and its immediate subdirectories. Also returns every
/// directory known to live directly inside a registration.
fn register_tree(
    root: &Path,
    platform: &dyn WatchPlatform,
    service: &dyn WatchService,
) -> Result<Registered, DirWatcherError> {
    let enumerate = DirWatcherError::init("could not enumerate subdirectories");
    let subdirs = platform.list_subdirectories(root).map_err(enumerate)?;

    let mut known_dirs = subdirs.clone();
    for subdir in &subdirs {
        let nested = platform
            .list_subdirectories(subdir)
            .map_err(DirWatcherError::init("could not enumerate subdirectories"))?;
        known_dirs.extend(nested);
    }

    let mut registrations = BTreeMap::new();
    for dir in std::iter::once(root).chain(subdirs.iter().map(PathBuf::as_path)) {
        let key = service
            .register(dir)
            .map_err(DirWatcherError::init("could not register with watch service"))?;
        registrations.insert(key, dir.to_path_buf());
    }
    Ok((registrations, known_dirs))
}

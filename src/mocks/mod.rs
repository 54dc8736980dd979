//! Test doubles for dependency injection
//!
//! Provides in-memory implementations of the platform capabilities and a
//! recording listener for isolated testing.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::traits::{
    DirListener, WatchBatch, WatchEvent, WatchEventKind, WatchKey, WatchPlatform, WatchService,
    WatchServiceError,
};

// ============================================================================
// ManualWatchService
// ============================================================================

enum Signal {
    Batch(WatchBatch),
    Wakeup,
}

#[derive(Default)]
struct ManualState {
    queue: VecDeque<Signal>,
    registered: BTreeMap<PathBuf, WatchKey>,
    invalid: HashSet<WatchKey>,
    next_key: u64,
    closed: bool,
    close_calls: usize,
    fail_register: bool,
    fail_close: Option<WatchServiceError>,
}

/// Manual watch service for testing
///
/// Does not touch the file system. Tests push batches directly; `take()`
/// hands them out in order and blocks while the queue is empty.
#[derive(Clone, Default)]
pub struct ManualWatchService {
    state: Arc<(Mutex<ManualState>, Condvar)>,
}

impl ManualWatchService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a batch for the next `take()`
    pub fn push(&self, batch: WatchBatch) {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().queue.push_back(Signal::Batch(batch));
        cvar.notify_all();
    }

    /// Queue a single overflow event for `key`
    pub fn push_overflow(&self, key: WatchKey) {
        self.push(WatchBatch {
            key,
            events: vec![WatchEvent::overflow()],
        });
    }

    /// Make later `reset(key)` calls report the registration invalid
    pub fn invalidate(&self, key: WatchKey) {
        self.state.0.lock().unwrap().invalid.insert(key);
    }

    /// Make every later `register()` call fail
    pub fn fail_register(&self) {
        self.state.0.lock().unwrap().fail_register = true;
    }

    /// Make `close()` report `error` (the service still ends up closed)
    pub fn fail_close_with(&self, error: WatchServiceError) {
        self.state.0.lock().unwrap().fail_close = Some(error);
    }

    pub fn key_for(&self, dir: &Path) -> Option<WatchKey> {
        self.state.0.lock().unwrap().registered.get(dir).copied()
    }

    pub fn registered_paths(&self) -> Vec<PathBuf> {
        self.state.0.lock().unwrap().registered.keys().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.0.lock().unwrap().closed
    }

    pub fn close_calls(&self) -> usize {
        self.state.0.lock().unwrap().close_calls
    }
}

impl WatchService for ManualWatchService {
    fn register(&self, dir: &Path) -> Result<WatchKey, WatchServiceError> {
        let mut state = self.state.0.lock().unwrap();
        if state.fail_register {
            return Err(WatchServiceError::Io(format!(
                "register refused: {}",
                dir.display()
            )));
        }
        if let Some(key) = state.registered.get(dir) {
            return Ok(*key);
        }
        state.next_key += 1;
        let key = WatchKey(state.next_key);
        state.registered.insert(dir.to_path_buf(), key);
        Ok(key)
    }

    fn take(&self) -> Result<WatchBatch, WatchServiceError> {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        loop {
            if let Some(signal) = state.queue.pop_front() {
                return match signal {
                    Signal::Batch(batch) => Ok(batch),
                    Signal::Wakeup => Err(WatchServiceError::Interrupted),
                };
            }
            if state.closed {
                return Err(WatchServiceError::Closed);
            }
            state = cvar.wait(state).unwrap();
        }
    }

    fn reset(&self, key: WatchKey) -> bool {
        let state = self.state.0.lock().unwrap();
        !state.closed && !state.invalid.contains(&key)
    }

    fn wakeup(&self) {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().queue.push_back(Signal::Wakeup);
        cvar.notify_all();
    }

    fn close(&self) -> Result<(), WatchServiceError> {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.close_calls += 1;
        state.closed = true;
        cvar.notify_all();
        match state.fail_close.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// ============================================================================
// ManualPlatform
// ============================================================================

/// Platform double that hands out a shared [`ManualWatchService`]
///
/// Subdirectory listings come from the real file system unless overridden
/// with [`ManualPlatform::fail_listing`].
#[derive(Clone, Default)]
pub struct ManualPlatform {
    service: ManualWatchService,
    fail_open: Arc<Mutex<bool>>,
    fail_listing: Arc<Mutex<bool>>,
}

impl ManualPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// The service every `open_watch_service()` call returns
    pub fn service(&self) -> &ManualWatchService {
        &self.service
    }

    pub fn fail_open(&self) {
        *self.fail_open.lock().unwrap() = true;
    }

    pub fn fail_listing(&self) {
        *self.fail_listing.lock().unwrap() = true;
    }
}

impl WatchPlatform for ManualPlatform {
    fn open_watch_service(&self) -> Result<Arc<dyn WatchService>, WatchServiceError> {
        if *self.fail_open.lock().unwrap() {
            return Err(WatchServiceError::Io("watch limit reached".to_string()));
        }
        Ok(Arc::new(self.service.clone()))
    }

    fn list_subdirectories(&self, dir: &Path) -> Result<Vec<PathBuf>, WatchServiceError> {
        if *self.fail_listing.lock().unwrap() {
            return Err(WatchServiceError::Io(format!(
                "cannot read {}",
                dir.display()
            )));
        }
        crate::production::read_subdirectories(dir)
    }
}

// ============================================================================
// RecordingListener
// ============================================================================

#[derive(Default)]
struct Recorded {
    creates: Vec<WatchEvent>,
    modifies: Vec<WatchEvent>,
    deletes: Vec<(WatchEvent, bool)>,
    overflows: Vec<WatchEvent>,
}

/// Listener that records every callback for assertions
#[derive(Default)]
pub struct RecordingListener {
    recorded: Mutex<Recorded>,
    changed: Condvar,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn creates(&self) -> usize {
        self.recorded.lock().unwrap().creates.len()
    }

    pub fn created_paths(&self) -> Vec<PathBuf> {
        self.recorded
            .lock()
            .unwrap()
            .creates
            .iter()
            .filter_map(|e| e.context.clone())
            .collect()
    }

    pub fn modifies(&self) -> usize {
        self.recorded.lock().unwrap().modifies.len()
    }

    /// `(relative path, is_directory)` for every delete, in order
    pub fn deletes(&self) -> Vec<(PathBuf, bool)> {
        self.recorded
            .lock()
            .unwrap()
            .deletes
            .iter()
            .map(|(e, is_dir)| (e.context.clone().unwrap_or_default(), *is_dir))
            .collect()
    }

    pub fn overflows(&self) -> usize {
        self.recorded.lock().unwrap().overflows.len()
    }

    /// Total number of callbacks received
    pub fn total(&self) -> usize {
        let r = self.recorded.lock().unwrap();
        r.creates.len() + r.modifies.len() + r.deletes.len() + r.overflows.len()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        *self.recorded.lock().unwrap() = Recorded::default();
    }

    /// Block until a callback of `kind` has been seen `count` times, or
    /// `timeout` elapses. Returns the count reached.
    pub fn wait_for(&self, kind: WatchEventKind, count: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut recorded = self.recorded.lock().unwrap();
        loop {
            let seen = match kind {
                WatchEventKind::Create => recorded.creates.len(),
                WatchEventKind::Modify => recorded.modifies.len(),
                WatchEventKind::Delete => recorded.deletes.len(),
                WatchEventKind::Overflow => recorded.overflows.len(),
            };
            let now = Instant::now();
            if seen >= count || now >= deadline {
                return seen;
            }
            recorded = self.changed.wait_timeout(recorded, deadline - now).unwrap().0;
        }
    }

    fn record(&self, f: impl FnOnce(&mut Recorded)) {
        f(&mut self.recorded.lock().unwrap());
        self.changed.notify_all();
    }
}

impl DirListener for RecordingListener {
    fn on_create(&self, event: &WatchEvent) {
        self.record(|r| r.creates.push(event.clone()));
    }

    fn on_modify(&self, event: &WatchEvent) {
        self.record(|r| r.modifies.push(event.clone()));
    }

    fn on_delete(&self, event: &WatchEvent, is_directory: bool) {
        self.record(|r| r.deletes.push((event.clone(), is_directory)));
    }

    fn on_overflow(&self, event: &WatchEvent) {
        self.record(|r| r.overflows.push(event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_returns_same_key_for_same_dir() {
        let service = ManualWatchService::new();
        let a = service.register(Path::new("/a")).unwrap();
        let b = service.register(Path::new("/b")).unwrap();
        assert_ne!(a, b);
        assert_eq!(service.register(Path::new("/a")).unwrap(), a);
        assert_eq!(service.registered_paths().len(), 2);
    }

    #[test]
    fn test_take_order_and_close() {
        let service = ManualWatchService::new();
        let key = service.register(Path::new("/a")).unwrap();
        service.push_overflow(key);
        service.wakeup();
        service.close().unwrap();

        assert_eq!(service.take().unwrap().events[0].kind, WatchEventKind::Overflow);
        assert_eq!(service.take(), Err(WatchServiceError::Interrupted));
        assert_eq!(service.take(), Err(WatchServiceError::Closed));
        assert!(!service.reset(key));
    }

    #[test]
    fn test_platform_scripted_failures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let platform = ManualPlatform::new();

        assert_eq!(
            platform.list_subdirectories(dir.path()).unwrap(),
            vec![dir.path().join("sub")]
        );
        assert!(platform.open_watch_service().is_ok());

        platform.fail_open();
        platform.fail_listing();
        assert!(platform.open_watch_service().is_err());
        assert!(platform.list_subdirectories(dir.path()).is_err());
    }

    #[test]
    fn test_wait_for_times_out() {
        let listener = RecordingListener::new();
        let seen = listener.wait_for(WatchEventKind::Create, 1, Duration::from_millis(20));
        assert_eq!(seen, 0);
    }
}

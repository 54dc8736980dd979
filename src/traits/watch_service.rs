//! Platform watch service trait for receiving directory change batches

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WatchServiceError {
    #[error("I/O error: {0}")]
    Io(String),
    /// A blocked `take()` was woken up by `wakeup()`.
    #[error("Wait interrupted")]
    Interrupted,
    #[error("Watch service is closed")]
    Closed,
    #[error("Cannot watch path: {0}")]
    Unsupported(PathBuf),
}

/// Token returned when registering a directory with a [`WatchService`].
///
/// Keys are unique per service and are re-armed with [`WatchService::reset`]
/// after each drained batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WatchKey(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    Create,
    Modify,
    Delete,
    /// Events were lost because the platform queue filled up.
    Overflow,
}

/// A raw event as delivered by the platform, scoped to one registration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    /// Entry name relative to the registered directory. `None` for overflow.
    pub context: Option<PathBuf>,
    /// How many times the platform saw this event; always at least 1.
    pub count: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, context: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            context: Some(context.into()),
            count: 1,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn overflow() -> Self {
        Self {
            kind: WatchEventKind::Overflow,
            context: None,
            count: 1,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Everything the service had pending for one registration.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchBatch {
    pub key: WatchKey,
    pub events: Vec<WatchEvent>,
}

/// Blocking directory notification channel
///
/// Production: `notify` crate (inotify / FSEvents / ReadDirectoryChangesW)
/// Testing: Manually pushed batches
#[cfg_attr(test, mockall::automock)]
pub trait WatchService: Send + Sync {
    /// Register a directory for create, modify and delete notifications.
    ///
    /// Registering the same directory twice returns the same key.
    fn register(&self, dir: &Path) -> Result<WatchKey, WatchServiceError>;

    /// Block until a registration has events ready.
    ///
    /// Returns `Interrupted` after [`wakeup`](WatchService::wakeup) and
    /// `Closed` once the service has been closed.
    fn take(&self) -> Result<WatchBatch, WatchServiceError>;

    /// Re-arm a key after its batch was drained. Returns false if the
    /// registration is no longer valid.
    fn reset(&self, key: WatchKey) -> bool;

    /// Interrupt a thread blocked in `take()`.
    fn wakeup(&self);

    /// Release the underlying handle.
    fn close(&self) -> Result<(), WatchServiceError>;
}

/// Host capabilities needed to build a watcher
#[cfg_attr(test, mockall::automock)]
pub trait WatchPlatform: Send + Sync {
    fn open_watch_service(&self) -> Result<Arc<dyn WatchService>, WatchServiceError>;

    /// Directories directly inside `dir`, not recursing further.
    fn list_subdirectories(&self, dir: &Path) -> Result<Vec<PathBuf>, WatchServiceError>;
}

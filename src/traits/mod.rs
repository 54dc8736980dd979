//! Trait definitions for dependency injection
//!
//! The platform watch primitive and the listener contract are abstracted
//! behind traits so the watcher core can be tested without the OS.

mod dir_listener;
mod watch_service;

pub use dir_listener::DirListener;
pub use watch_service::{
    WatchBatch, WatchEvent, WatchEventKind, WatchKey, WatchPlatform, WatchService,
    WatchServiceError,
};

#[cfg(test)]
pub use dir_listener::MockDirListener;
#[cfg(test)]
pub use watch_service::{MockWatchPlatform, MockWatchService};

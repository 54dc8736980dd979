//! Production implementations of traits

mod notify_service;

pub use notify_service::{read_subdirectories, NotifyPlatform, NotifyWatchService};

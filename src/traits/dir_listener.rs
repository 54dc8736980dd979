//! Listener contract for directory change callbacks

use super::WatchEvent;

/// Receives classified events from a [`DirWatcher`](crate::DirWatcher).
///
/// Callbacks run synchronously on the watcher's pump thread, in the order the
/// platform delivered the events. A panic inside a callback is caught and
/// logged; other listeners still receive the event.
///
/// There are deliberately no default methods: every implementer decides what
/// each callback does.
#[cfg_attr(test, mockall::automock)]
pub trait DirListener: Send + Sync {
    fn on_create(&self, event: &WatchEvent);

    /// May fire more than once for a single logical write.
    fn on_modify(&self, event: &WatchEvent);

    /// `is_directory` is decided from what was known before the entry vanished.
    fn on_delete(&self, event: &WatchEvent, is_directory: bool);

    /// The platform dropped events. `event.context` is always `None`.
    fn on_overflow(&self, event: &WatchEvent);
}

//! Insertion-ordered, identity-deduplicated set of listeners
//!
//! The registry holds `Weak` references only. Callers own their listeners; a
//! listener that has been dropped is pruned the next time a snapshot is taken.

use std::sync::{Arc, Mutex, Weak};

use crate::traits::DirListener;

/// Compares the data pointer only; vtable pointers of the same type may differ
/// between codegen units.
fn same_listener(a: &Weak<dyn DirListener>, b: &Weak<dyn DirListener>) -> bool {
    std::ptr::eq(a.as_ptr() as *const (), b.as_ptr() as *const ())
}

#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Weak<dyn DirListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener. Returns false if it was already registered.
    pub fn add(&self, listener: Weak<dyn DirListener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn remove(&self, listener: &Weak<dyn DirListener>) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    /// Live listeners in registration order. Dead entries are dropped.
    pub fn snapshot(&self) -> Vec<Arc<dyn DirListener>> {
        let mut listeners = self.listeners.lock().unwrap();
        let mut live = Vec::with_capacity(listeners.len());
        listeners.retain(|l| match l.upgrade() {
            Some(listener) => {
                live.push(listener);
                true
            }
            None => false,
        });
        live
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::RecordingListener;

    fn weak(listener: &Arc<RecordingListener>) -> Weak<dyn DirListener> {
        Arc::downgrade(listener) as Weak<dyn DirListener>
    }

    #[test]
    fn test_add_is_idempotent() {
        let registry = ListenerRegistry::new();
        let listener = Arc::new(RecordingListener::new());

        assert!(registry.add(weak(&listener)));
        assert!(!registry.add(weak(&listener)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_keeps_insertion_order() {
        let registry = ListenerRegistry::new();
        let first = Arc::new(RecordingListener::new());
        let second = Arc::new(RecordingListener::new());
        registry.add(weak(&second));
        registry.add(weak(&first));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(std::ptr::eq(
            Arc::as_ptr(&snapshot[0]) as *const (),
            Arc::as_ptr(&second) as *const ()
        ));
        assert!(std::ptr::eq(
            Arc::as_ptr(&snapshot[1]) as *const (),
            Arc::as_ptr(&first) as *const ()
        ));
    }

    #[test]
    fn test_remove_reports_whether_removed() {
        let registry = ListenerRegistry::new();
        let listener = Arc::new(RecordingListener::new());
        let stranger = Arc::new(RecordingListener::new());
        registry.add(weak(&listener));

        assert!(!registry.remove(&weak(&stranger)));
        assert!(registry.remove(&weak(&listener)));
        assert!(!registry.remove(&weak(&listener)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_prunes_dropped_listeners() {
        let registry = ListenerRegistry::new();
        let kept = Arc::new(RecordingListener::new());
        let dropped = Arc::new(RecordingListener::new());
        registry.add(weak(&kept));
        registry.add(weak(&dropped));
        drop(dropped);

        assert_eq!(registry.snapshot().len(), 1);
        assert_eq!(registry.len(), 1);
    }
}

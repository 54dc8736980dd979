//! End-to-end tests for the directory watcher.
//!
//! Tests the full flow: OS event → notify service → pump → listener

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use dirwatch::mocks::{ManualPlatform, RecordingListener};
use dirwatch::traits::{DirListener, WatchBatch, WatchEvent, WatchEventKind};
use dirwatch::{DirWatcher, DirWatcherError};

/// Upper bound for an OS event to reach the listener
const DEADLINE: Duration = Duration::from_secs(3);
/// Quiet period used to check that no extra callbacks arrive
const SETTLE: Duration = Duration::from_millis(200);

fn listener_for(watcher: &DirWatcher) -> Arc<RecordingListener> {
    let listener = Arc::new(RecordingListener::new());
    watcher
        .add_listener(Arc::downgrade(&listener) as Weak<dyn DirListener>)
        .unwrap();
    listener
}

/// Wait for `count` callbacks of `kind`, then give the platform time to
/// deliver any extras and return the final count.
fn settled_count(listener: &RecordingListener, kind: WatchEventKind, count: usize) -> usize {
    listener.wait_for(kind, count, DEADLINE);
    thread::sleep(SETTLE);
    listener.wait_for(kind, usize::MAX, Duration::ZERO)
}

/// Build a started watcher over a fresh directory with one existing subdirectory
fn setup() -> (TempDir, DirWatcher, Arc<RecordingListener>) {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("existing")).unwrap();

    let watcher = DirWatcher::new(dir.path()).unwrap();
    let listener = listener_for(&watcher);
    watcher.start_watch().unwrap();
    // Let the pump reach its blocking wait.
    thread::sleep(Duration::from_millis(50));
    (dir, watcher, listener)
}

#[test]
fn test_create_modify_delete_file_and_directory() {
    let (_dir, watcher, listener) = setup();
    let test_file = watcher.root().join("test.file");
    let test_dir = watcher.root().join("testdir");

    // 1. Create file → exactly one create
    fs::File::create(&test_file).unwrap();
    assert_eq!(settled_count(&listener, WatchEventKind::Create, 1), 1);
    assert_eq!(listener.created_paths(), vec![PathBuf::from("test.file")]);
    listener.clear();

    // 2. Create directory → exactly one create
    fs::create_dir(&test_dir).unwrap();
    assert_eq!(settled_count(&listener, WatchEventKind::Create, 1), 1);
    listener.clear();

    // 3. Write bytes → the platform may report the write more than once
    fs::write(&test_file, b"TEST_TEXT").unwrap();
    let modifies = settled_count(&listener, WatchEventKind::Modify, 1);
    assert!(
        (1..=2).contains(&modifies),
        "expected 1 or 2 modify events, got {modifies}"
    );
    listener.clear();

    // 4. Delete file → one delete, not a directory
    fs::remove_file(&test_file).unwrap();
    assert_eq!(settled_count(&listener, WatchEventKind::Delete, 1), 1);
    assert_eq!(listener.deletes(), vec![(PathBuf::from("test.file"), false)]);
    listener.clear();

    // 5. Delete directory created while watching → one delete, a directory
    fs::remove_dir(&test_dir).unwrap();
    assert_eq!(settled_count(&listener, WatchEventKind::Delete, 1), 1);
    assert_eq!(listener.deletes(), vec![(PathBuf::from("testdir"), true)]);

    watcher.stop_watch().unwrap();
    watcher.close().unwrap();
}

#[test]
fn test_events_in_existing_subdirectory() {
    let (_dir, watcher, listener) = setup();

    fs::write(watcher.root().join("existing").join("inner.txt"), b"x").unwrap();

    assert!(listener.wait_for(WatchEventKind::Create, 1, DEADLINE) >= 1);
    assert_eq!(listener.created_paths()[0], PathBuf::from("inner.txt"));
}

#[test]
fn test_delete_registered_subdirectory() {
    let (_dir, watcher, listener) = setup();
    let existing = watcher.root().join("existing");
    assert!(watcher.registered_dirs().contains(&existing));

    fs::remove_dir(&existing).unwrap();

    assert_eq!(settled_count(&listener, WatchEventKind::Delete, 1), 1);
    assert_eq!(listener.deletes(), vec![(PathBuf::from("existing"), true)]);
    assert!(!watcher.registered_dirs().contains(&existing));
    assert!(watcher.is_started());
}

#[test]
fn test_new_subdirectories_are_not_registered() {
    let (_dir, watcher, listener) = setup();
    let late = watcher.root().join("late");

    fs::create_dir(&late).unwrap();
    assert_eq!(settled_count(&listener, WatchEventKind::Create, 1), 1);

    fs::write(late.join("unseen.txt"), b"x").unwrap();
    assert_eq!(settled_count(&listener, WatchEventKind::Create, 1), 1);
    assert!(!watcher.registered_dirs().contains(&late));
}

#[test]
fn test_nothing_dispatched_while_stopped() {
    let (_dir, watcher, listener) = setup();
    watcher.stop_watch().unwrap();

    fs::File::create(watcher.root().join("quiet.file")).unwrap();
    thread::sleep(SETTLE);
    assert_eq!(listener.total(), 0);

    // The handle stays open while stopped, so the queued event is delivered
    // once the pump restarts, ahead of newer ones.
    watcher.start_watch().unwrap();
    fs::File::create(watcher.root().join("loud.file")).unwrap();
    assert_eq!(listener.wait_for(WatchEventKind::Create, 2, DEADLINE), 2);
    assert_eq!(
        listener.created_paths(),
        vec![PathBuf::from("quiet.file"), PathBuf::from("loud.file")]
    );
}

#[test]
fn test_removed_listener_gets_nothing() {
    let (_dir, watcher, listener) = setup();
    let other = listener_for(&watcher);
    assert!(watcher
        .remove_listener(Arc::downgrade(&listener) as Weak<dyn DirListener>)
        .unwrap());

    fs::File::create(watcher.root().join("a.file")).unwrap();

    assert_eq!(other.wait_for(WatchEventKind::Create, 1, DEADLINE), 1);
    assert_eq!(listener.total(), 0);
}

#[test]
fn test_overflow_reaches_every_listener_once() {
    let dir = tempfile::tempdir().unwrap();
    let platform = ManualPlatform::new();
    let watcher = DirWatcher::with_platform(dir.path(), &platform).unwrap();
    let first = listener_for(&watcher);
    let second = listener_for(&watcher);
    let key = platform.service().key_for(watcher.root()).unwrap();

    watcher.start_watch().unwrap();
    platform.service().push(WatchBatch {
        key,
        events: vec![
            WatchEvent::overflow(),
            WatchEvent::new(WatchEventKind::Create, "after.file"),
        ],
    });

    for listener in [&first, &second] {
        assert_eq!(listener.wait_for(WatchEventKind::Create, 1, DEADLINE), 1);
        assert_eq!(listener.overflows(), 1);
        assert_eq!(listener.total(), 2);
    }
}

#[test]
fn test_invalid_paths_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("plain.file");
    fs::write(&file, b"x").unwrap();

    assert!(matches!(
        DirWatcher::new(dir.path().join("not_exist")),
        Err(DirWatcherError::InvalidArgument(_))
    ));
    assert!(matches!(
        DirWatcher::new(&file),
        Err(DirWatcherError::InvalidArgument(_))
    ));
}

#[test]
fn test_close_from_another_thread() {
    let (_dir, watcher, _listener) = setup();
    let watcher = Arc::new(watcher);

    let closer = {
        let watcher = Arc::clone(&watcher);
        thread::spawn(move || watcher.close())
    };
    closer.join().unwrap().unwrap();

    assert!(watcher.is_closed());
    assert!(!watcher.is_started());
    assert!(watcher.close().is_ok());
    assert!(watcher.start_watch().is_err());
}

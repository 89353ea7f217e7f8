//! File watcher against the OS notification backend

use std::{sync::Arc, time::Duration};

use nimbus_core::domain::{ContentHash, SyncPath};
use nimbus_sync::{watcher::FileWatcher, WatchEvent, WatchEventKind, WatchStream, WatcherError};
use nimbus_transfer::{Fingerprint, WriteLog};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

const DEBOUNCE: Duration = Duration::from_millis(50);

fn setup() -> (TempDir, SyncPath, Arc<WriteLog>) {
    let dir = tempfile::tempdir().unwrap();
    let root = SyncPath::new(dir.path().to_path_buf()).unwrap();
    (dir, root, Arc::new(WriteLog::default()))
}

async fn next_event(stream: &mut WatchStream) -> WatchEvent {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("no event in time")
        .expect("stream ended")
        .expect("watcher failed")
}

#[tokio::test]
async fn test_new_file_is_reported_once() {
    let (dir, root, log) = setup();
    let mut stream = FileWatcher::with_debounce(DEBOUNCE, log).watch(&root).unwrap();

    std::fs::write(dir.path().join("hello.txt"), b"hi").unwrap();

    let event = next_event(&mut stream).await;
    assert_eq!(event.kind, WatchEventKind::Add);
    assert_eq!(event.path.as_path(), dir.path().join("hello.txt"));
    assert_eq!(event.stat.unwrap().size, 2);

    // create, modify and close collapse into the single add
    std::fs::write(dir.path().join("marker"), b"").unwrap();
    let event = next_event(&mut stream).await;
    assert_eq!(event.path.as_path(), dir.path().join("marker"));
}

#[tokio::test]
async fn test_new_directory_is_reported() {
    let (dir, root, log) = setup();
    let mut stream = FileWatcher::with_debounce(DEBOUNCE, log).watch(&root).unwrap();

    std::fs::create_dir(dir.path().join("photos")).unwrap();

    let event = next_event(&mut stream).await;
    assert_eq!(event.kind, WatchEventKind::AddDir);
    assert_eq!(event.path.as_path(), dir.path().join("photos"));
}

#[tokio::test]
async fn test_short_lived_file_is_not_reported() {
    let (dir, root, log) = setup();
    let mut stream = FileWatcher::with_debounce(DEBOUNCE, log).watch(&root).unwrap();

    let temp = dir.path().join("scratch.tmp");
    std::fs::write(&temp, b"gone soon").unwrap();
    std::fs::remove_file(&temp).unwrap();
    tokio::time::sleep(DEBOUNCE * 4).await;
    std::fs::write(dir.path().join("marker"), b"").unwrap();

    let event = next_event(&mut stream).await;
    assert_eq!(event.path.as_path(), dir.path().join("marker"));
}

#[tokio::test]
async fn test_removal_of_existing_file() {
    let (dir, root, log) = setup();
    let existing = dir.path().join("old.txt");
    std::fs::write(&existing, b"old").unwrap();
    let mut stream = FileWatcher::with_debounce(DEBOUNCE, log).watch(&root).unwrap();

    std::fs::remove_file(&existing).unwrap();

    let event = next_event(&mut stream).await;
    assert_eq!(event.kind, WatchEventKind::Unlink);
    assert!(event.stat.is_none());
}

#[tokio::test]
async fn test_engine_writes_are_suppressed() {
    let (dir, root, log) = setup();
    let mut stream = FileWatcher::with_debounce(DEBOUNCE, log.clone())
        .watch(&root)
        .unwrap();

    let echoed = dir.path().join("downloaded.bin");
    let content = b"written by the engine";
    log.record(
        &echoed,
        Fingerprint::Content(ContentHash::from_digest(&Sha256::digest(content))),
    );
    std::fs::write(&echoed, content).unwrap();
    tokio::time::sleep(DEBOUNCE * 4).await;
    std::fs::write(dir.path().join("marker"), b"").unwrap();

    let event = next_event(&mut stream).await;
    assert_eq!(event.path.as_path(), dir.path().join("marker"));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (_dir, root, log) = setup();
    let mut stream = FileWatcher::with_debounce(DEBOUNCE, log).watch(&root).unwrap();
    let handle = stream.stop_handle();

    handle.stop();
    stream.stop();
    stream.stop();

    assert!(stream.is_stopped());
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_missing_root_is_fatal() {
    let (dir, _root, log) = setup();
    let missing = SyncPath::new(dir.path().join("not-there")).unwrap();

    let result = FileWatcher::with_debounce(DEBOUNCE, log).watch(&missing);

    assert!(matches!(result, Err(WatcherError::RootMissing(_))));
}

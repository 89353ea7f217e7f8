//! Operation handling: uploads, remote changes, user actions and retries

use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use nimbus_core::{
    classify::ErrorKind,
    domain::{EntryState, OperationKind, Source, SyncOperation},
    ports::RemoteStorage,
};
use nimbus_placeholder::DriverCommand;
use nimbus_sync::{OperationOutcome, WatchEventKind};
use nimbus_transfer::{Fault, RemoteCall};

use crate::common::{report_for, Harness, MAX_ATTEMPTS};

#[tokio::test]
async fn test_local_add_uploads_file() {
    let h = Harness::new().await;
    let path = h.write_local("notes.txt", b"first draft", Utc::now());

    h.local(WatchEventKind::Add, &path).await;

    let item = h.remote.find(None, "notes.txt").unwrap();
    assert_eq!(h.remote.content(&item.id).unwrap(), b"first draft");
    let entry = h.machine.get_state(&path).unwrap();
    assert_eq!(entry.state(), EntryState::Hydrated);
    assert_eq!(entry.remote_id(), Some(&item.id));
    assert_eq!(entry.content_hash(), item.content_hash.as_ref());
}

#[tokio::test]
async fn test_unchanged_file_is_not_uploaded_twice() {
    let h = Harness::new().await;
    let path = h.write_local("notes.txt", b"same", Utc::now());

    h.local(WatchEventKind::Add, &path).await;
    h.local(WatchEventKind::Change, &path).await;

    assert_eq!(h.remote.calls(RemoteCall::BeginUpload), 1);
}

#[tokio::test]
async fn test_nested_add_creates_remote_folders() {
    let h = Harness::new().await;
    let path = h.write_local("docs/2026/plan.md", b"# plan", Utc::now());

    h.local(WatchEventKind::Add, &path).await;

    let docs = h.remote.find(None, "docs").unwrap();
    let year = h.remote.find(Some(&docs.id), "2026").unwrap();
    let file = h.remote.find(Some(&year.id), "plan.md").unwrap();
    assert!(docs.is_directory());
    assert_eq!(h.remote.content(&file.id).unwrap(), b"# plan");

    let dir_entry = h.machine.get_state(&h.path("docs")).unwrap();
    assert!(dir_entry.is_directory());
    assert_eq!(dir_entry.remote_id(), Some(&docs.id));
}

#[tokio::test]
async fn test_local_unlink_deletes_remote() {
    let h = Harness::new().await;
    let path = h.write_local("old.txt", b"bye", Utc::now());
    h.local(WatchEventKind::Add, &path).await;
    let item = h.remote.find(None, "old.txt").unwrap();

    std::fs::remove_file(path.as_path()).unwrap();
    h.local(WatchEventKind::Unlink, &path).await;

    assert!(h.remote.item(&item.id).is_none());
    assert!(h.machine.get_state(&path).is_none());
}

#[tokio::test]
async fn test_stale_unlink_is_ignored() {
    let h = Harness::new().await;
    let path = h.write_local("back.txt", b"still here", Utc::now());
    h.local(WatchEventKind::Add, &path).await;

    // the file exists again by the time the removal is processed
    h.local(WatchEventKind::Unlink, &path).await;

    assert!(h.remote.find(None, "back.txt").is_some());
    assert!(h.machine.get_state(&path).is_some());
}

#[tokio::test]
async fn test_remote_add_registers_placeholder_only() {
    let h = Harness::new().await;
    let (path, item) = h.seed_remote("report.pdf", &[3u8; 2048], Utc::now()).await;

    let entry = h.machine.get_state(&path).unwrap();
    assert_eq!(entry.state(), EntryState::Placeholder);
    assert_eq!(entry.remote_id(), Some(&item.id));
    assert_eq!(entry.declared_size(), 2048);
    assert_eq!(h.remote.calls(RemoteCall::Download), 0);
}

#[tokio::test]
async fn test_user_hydrate_downloads_content() {
    let h = Harness::new().await;
    let (path, _) = h.seed_remote("photo.jpg", b"jpeg bytes", Utc::now()).await;
    let mut reports = h.subscribe();

    h.user(OperationKind::Hydrate, &path).await;

    let report = report_for(&mut reports, &path).await;
    assert_eq!(report.outcome, OperationOutcome::Succeeded);
    assert_eq!(report.attempts, 1);
    assert_eq!(h.read(&path), b"jpeg bytes");
    assert_eq!(
        h.machine.get_state(&path).unwrap().state(),
        EntryState::Hydrated
    );
}

#[tokio::test]
async fn test_network_failure_is_retried() {
    let h = Harness::new().await;
    let (path, _) = h.seed_remote("flaky.bin", &[9u8; 512], Utc::now()).await;
    h.remote.fail_next(RemoteCall::Download, Fault::Network);
    let mut reports = h.subscribe();

    h.user(OperationKind::Hydrate, &path).await;

    let report = report_for(&mut reports, &path).await;
    assert_eq!(report.outcome, OperationOutcome::Succeeded);
    assert_eq!(report.attempts, 2);
    assert_eq!(h.remote.calls(RemoteCall::Download), 2);
    let entry = h.machine.get_state(&path).unwrap();
    assert_eq!(entry.state(), EntryState::Hydrated);
    assert!(entry.last_error().is_none());
}

#[tokio::test]
async fn test_exhausted_retries_wait_for_user() {
    let h = Harness::new().await;
    let (path, _) = h.seed_remote("broken.bin", &[1u8; 64], Utc::now()).await;
    for _ in 0..MAX_ATTEMPTS {
        h.remote.fail_next(RemoteCall::Download, Fault::Unknown);
    }
    let mut reports = h.subscribe();

    h.orchestrator
        .submit(SyncOperation::new(
            OperationKind::Hydrate,
            path.clone(),
            Source::RemoteFeed,
        ))
        .await
        .unwrap();
    h.settle().await;

    let report = report_for(&mut reports, &path).await;
    assert_eq!(report.attempts, MAX_ATTEMPTS);
    match report.outcome {
        OperationOutcome::Failed { error, exhausted } => {
            assert_eq!(error.kind, ErrorKind::Unknown);
            assert!(exhausted);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let entry = h.machine.get_state(&path).unwrap();
    assert_eq!(entry.state(), EntryState::Error);
    assert!(entry.has_exhausted_error());

    // automatic hydration no longer retries
    h.orchestrator
        .submit(SyncOperation::new(
            OperationKind::Hydrate,
            path.clone(),
            Source::RemoteFeed,
        ))
        .await
        .unwrap();
    h.settle().await;
    let report = report_for(&mut reports, &path).await;
    assert_eq!(report.outcome, OperationOutcome::Absorbed);
    assert_eq!(h.remote.calls(RemoteCall::Download), MAX_ATTEMPTS as usize);

    // an explicit request does
    h.user(OperationKind::Hydrate, &path).await;
    let report = report_for(&mut reports, &path).await;
    assert_eq!(report.outcome, OperationOutcome::Succeeded);
    let entry = h.machine.get_state(&path).unwrap();
    assert_eq!(entry.state(), EntryState::Hydrated);
    assert!(!entry.has_exhausted_error());
}

/// Collects formatted log output for assertions
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_exhausted_retries_are_logged_as_errors() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::ERROR)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    // the current-thread runtime keeps every worker on this thread
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = Harness::new().await;
    let (path, _) = h.seed_remote("doomed.bin", &[7u8; 32], Utc::now()).await;
    for _ in 0..MAX_ATTEMPTS {
        h.remote.fail_next(RemoteCall::Download, Fault::Network);
    }
    h.user(OperationKind::Hydrate, &path).await;

    let output = logs.contents();
    assert_eq!(output.matches("Retries exhausted").count(), 1, "{output}");
    assert!(output.contains("ERROR"), "{output}");
}

#[tokio::test]
async fn test_pin_hydrates_and_blocks_dehydrate() {
    let h = Harness::new().await;
    let (path, _) = h.seed_remote("keep.txt", b"always local", Utc::now()).await;

    h.user(OperationKind::Pin, &path).await;

    let entry = h.machine.get_state(&path).unwrap();
    assert!(entry.is_pinned());
    assert_eq!(entry.state(), EntryState::Hydrated);
    assert_eq!(h.read(&path), b"always local");

    let mut reports = h.subscribe();
    h.user(OperationKind::Dehydrate, &path).await;

    let report = report_for(&mut reports, &path).await;
    assert_eq!(report.attempts, 1);
    match report.outcome {
        OperationOutcome::Failed { error, exhausted } => {
            assert_eq!(error.kind, ErrorKind::Pinned);
            assert!(!exhausted);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(h.read(&path), b"always local");
}

#[tokio::test]
async fn test_unpin_then_dehydrate_frees_content() {
    let h = Harness::new().await;
    let (path, _) = h.seed_remote("big.iso", &[5u8; 4096], Utc::now()).await;
    h.user(OperationKind::Pin, &path).await;

    h.user(OperationKind::Unpin, &path).await;
    h.user(OperationKind::Dehydrate, &path).await;

    let entry = h.machine.get_state(&path).unwrap();
    assert!(!entry.is_pinned());
    assert_eq!(entry.state(), EntryState::Dehydrated);
    assert_eq!(std::fs::metadata(path.as_path()).unwrap().len(), 0);
}

#[tokio::test]
async fn test_remote_unlink_removes_entry() {
    let h = Harness::new().await;
    let (path, _) = h.seed_remote("gone.txt", b"x", Utc::now()).await;

    h.remote_event(OperationKind::Unlink, &path, None).await;

    assert!(h.machine.get_state(&path).is_none());
    assert!(h
        .driver
        .commands()
        .iter()
        .any(|c| matches!(c, DriverCommand::Delete { path: p } if p == &path)));
}

#[tokio::test]
async fn test_remote_unlink_keeps_local_edits() {
    let h = Harness::new().await;
    let synced_at = Utc::now() - Duration::hours(1);
    let path = h.write_local("draft.txt", b"v1", synced_at);
    h.local(WatchEventKind::Add, &path).await;
    let item = h.remote.find(None, "draft.txt").unwrap();

    h.write_local("draft.txt", b"v2 not yet uploaded", Utc::now());
    h.remote.delete(&item.id).await.unwrap();
    h.remote_event(OperationKind::Unlink, &path, None).await;

    assert_eq!(h.read(&path), b"v2 not yet uploaded");
    let uploaded = h.remote.find(None, "draft.txt").unwrap();
    assert_eq!(h.remote.content(&uploaded.id).unwrap(), b"v2 not yet uploaded");
    assert_eq!(
        h.machine.get_state(&path).unwrap().remote_id(),
        Some(&uploaded.id)
    );
}

#[tokio::test]
async fn test_remote_directory_add() {
    let h = Harness::new().await;
    let folder = h.remote.insert_folder(None, "Music").unwrap();
    let path = h.path("Music");

    h.remote_event(OperationKind::AddDir, &path, Some(folder.clone()))
        .await;

    let entry = h.machine.get_state(&path).unwrap();
    assert!(entry.is_directory());
    assert_eq!(entry.remote_id(), Some(&folder.id));
}

#[tokio::test]
async fn test_shutdown_refuses_new_work() {
    let h = Harness::new().await;
    h.orchestrator.shutdown().await;

    let path = h.write_local("late.txt", b"late", Utc::now());
    let result = h
        .orchestrator
        .submit_user_action(OperationKind::Add, path)
        .await;

    assert!(matches!(result, Err(nimbus_sync::SyncError::QueueClosed)));
}

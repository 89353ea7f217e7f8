//! Hydration: download, join, failure, abort and remote refresh

use std::time::Duration;

use chrono::Utc;
use nimbus_core::{
    classify::{ErrorKind, OpContext},
    domain::{DomainError, EntryState},
};
use nimbus_placeholder::{DriverCommand, HydrationOutcome, PlaceholderError, Registration};
use nimbus_transfer::{Fault, RemoteCall};

use crate::common::{wait_for, Harness};

fn ctx() -> OpContext {
    OpContext::new("hydrate")
}

#[tokio::test]
async fn test_hydrate_downloads_content() {
    let h = Harness::new().await;
    let (path, item) = h.seed_file("notes.txt", b"hello nimbus").await;

    let outcome = h.machine.hydrate(&path, ctx()).await.unwrap();

    assert_eq!(outcome, HydrationOutcome::Hydrated);
    assert_eq!(h.read(&path), b"hello nimbus");
    let entry = h.machine.get_state(&path).unwrap();
    assert_eq!(entry.state(), EntryState::Hydrated);
    assert_eq!(entry.content_hash(), item.content_hash.as_ref());
    assert!(entry.local_modified().is_some());
    assert_eq!(h.store.get(&path).unwrap().state(), EntryState::Hydrated);
}

#[tokio::test]
async fn test_hydrate_is_idempotent() {
    let h = Harness::new().await;
    let (path, _) = h.seed_file("a.bin", &[7u8; 1000]).await;

    h.machine.hydrate(&path, ctx()).await.unwrap();
    let second = h.machine.hydrate(&path, ctx()).await.unwrap();

    assert_eq!(second, HydrationOutcome::AlreadyHydrated);
    assert_eq!(h.remote.calls(RemoteCall::Download), 1);
}

#[tokio::test]
async fn test_concurrent_hydrations_share_one_download() {
    let h = Harness::new().await;
    let (path, _) = h.seed_file("shared.bin", &[1u8; 4096]).await;
    h.remote.set_download_chunk(512);
    h.remote.set_download_delay(Some(Duration::from_millis(5)));

    let (a, b, c) = tokio::join!(
        h.machine.hydrate(&path, ctx()),
        h.machine.hydrate(&path, ctx()),
        h.machine.hydrate(&path, ctx()),
    );

    for outcome in [a.unwrap(), b.unwrap(), c.unwrap()] {
        assert!(outcome.is_success());
    }
    assert_eq!(h.remote.calls(RemoteCall::Download), 1);
    assert_eq!(h.read(&path).len(), 4096);
}

#[tokio::test]
async fn test_hydration_reports_progress_to_driver() {
    let h = Harness::new().await;
    let (path, _) = h.seed_file("progress.bin", &[3u8; 2048]).await;
    h.remote.set_download_chunk(256);

    h.machine.hydrate(&path, ctx()).await.unwrap();

    let progress = h.driver.progress(&path);
    assert!(!progress.is_empty());
    assert_eq!(progress.last().copied(), Some(1.0));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_failed_hydration_records_error() {
    let h = Harness::new().await;
    let (path, _) = h.seed_file("flaky.txt", b"content").await;
    h.remote.fail_next(RemoteCall::Download, Fault::Network);

    let outcome = h.machine.hydrate(&path, ctx()).await.unwrap();

    let HydrationOutcome::Failed(err) = outcome else {
        panic!("expected a failure, got {outcome:?}");
    };
    assert_eq!(err.kind, ErrorKind::Network);

    let entry = h.machine.get_state(&path).unwrap();
    assert_eq!(entry.state(), EntryState::Error);
    assert_eq!(entry.last_error().unwrap().kind, ErrorKind::Network);
    assert!(!h.machine.is_busy(&path));

    // Error is hydratable again
    let retry = h.machine.hydrate(&path, ctx()).await.unwrap();
    assert_eq!(retry, HydrationOutcome::Hydrated);
    assert!(h.machine.get_state(&path).unwrap().last_error().is_none());
}

#[tokio::test]
async fn test_corrupted_download_is_not_published() {
    let h = Harness::new().await;
    let (path, _) = h.seed_file("bits.bin", &[9u8; 300]).await;
    h.remote.fail_next(RemoteCall::Download, Fault::Corrupted);

    let outcome = h.machine.hydrate(&path, ctx()).await.unwrap();

    assert!(matches!(outcome, HydrationOutcome::Failed(_)));
    assert_eq!(h.machine.get_state(&path).unwrap().state(), EntryState::Error);
    assert!(!path.as_path().exists());
}

#[tokio::test]
async fn test_cancelled_hydration_returns_to_prior_state() {
    let h = Harness::new().await;
    let (path, _) = h.seed_file("big.iso", &[0u8; 8192]).await;
    h.remote.set_download_chunk(128);
    h.remote.set_download_delay(Some(Duration::from_millis(20)));

    let machine = h.machine.clone();
    let task_path = path.clone();
    let task = tokio::spawn(async move { machine.hydrate(&task_path, ctx()).await });

    wait_for(|| h.machine.is_busy(&path)).await;
    assert_eq!(h.machine.get_state(&path).unwrap().state(), EntryState::Hydrating);
    assert!(h.machine.cancel_hydration(&path));

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, HydrationOutcome::Aborted);
    let entry = h.machine.get_state(&path).unwrap();
    assert_eq!(entry.state(), EntryState::Placeholder);
    assert!(entry.last_error().is_none());
}

#[tokio::test]
async fn test_hydrate_unknown_path_is_not_found() {
    let h = Harness::new().await;
    let err = h.machine.hydrate(&h.path("ghost"), ctx()).await.unwrap_err();
    assert!(matches!(err, PlaceholderError::NotFound(_)));
}

#[tokio::test]
async fn test_hydrate_without_remote_id_is_rejected() {
    let h = Harness::new().await;
    let path = h.path("local-only.txt");
    h.machine
        .register_placeholder(&path, Registration::file(4, None))
        .await
        .unwrap();

    let err = h.machine.hydrate(&path, ctx()).await.unwrap_err();
    assert!(matches!(
        err,
        PlaceholderError::Domain(DomainError::ValidationFailed(_))
    ));
}

#[tokio::test]
async fn test_directories_are_always_hydrated() {
    let h = Harness::new().await;
    let dir = h.path("photos");
    h.machine
        .register_placeholder(&dir, Registration::directory())
        .await
        .unwrap();

    let outcome = h.machine.hydrate(&dir, ctx()).await.unwrap();
    assert_eq!(outcome, HydrationOutcome::AlreadyHydrated);
    assert_eq!(h.remote.calls(RemoteCall::Download), 0);
}

#[tokio::test]
async fn test_remote_change_refreshes_hydrated_file() {
    let h = Harness::new().await;
    let (path, item) = h.seed_file("doc.txt", b"version one").await;
    h.machine.hydrate(&path, ctx()).await.unwrap();

    let updated = h
        .remote
        .update_content(&item.id, b"version two, longer", Utc::now())
        .unwrap();
    let outcome = h
        .machine
        .apply_remote_content(&path, &updated, ctx())
        .await
        .unwrap();

    assert_eq!(outcome, HydrationOutcome::Hydrated);
    assert_eq!(h.read(&path), b"version two, longer");
    let entry = h.machine.get_state(&path).unwrap();
    assert_eq!(entry.state(), EntryState::Hydrated);
    assert_eq!(entry.content_hash(), updated.content_hash.as_ref());
    assert_eq!(entry.declared_size(), updated.size);

    // Same content again moves nothing
    let again = h
        .machine
        .apply_remote_content(&path, &updated, ctx())
        .await
        .unwrap();
    assert_eq!(again, HydrationOutcome::AlreadyHydrated);
    assert_eq!(h.remote.calls(RemoteCall::Download), 2);
}

#[tokio::test]
async fn test_failed_refresh_leaves_error_without_stale_bytes() {
    let h = Harness::new().await;
    let (path, item) = h.seed_file("doc.txt", b"version one").await;
    h.machine.hydrate(&path, ctx()).await.unwrap();

    let updated = h
        .remote
        .update_content(&item.id, b"version two", Utc::now())
        .unwrap();
    h.remote.fail_next(RemoteCall::Download, Fault::Network);
    let outcome = h
        .machine
        .apply_remote_content(&path, &updated, ctx())
        .await
        .unwrap();

    let HydrationOutcome::Failed(err) = outcome else {
        panic!("expected a failure, got {outcome:?}");
    };
    assert_eq!(err.kind, ErrorKind::Network);
    let entry = h.machine.get_state(&path).unwrap();
    assert_eq!(entry.state(), EntryState::Error);
    assert_eq!(entry.last_error().unwrap().kind, ErrorKind::Network);
    assert_eq!(entry.content_hash(), updated.content_hash.as_ref());
    assert!(h.read(&path).is_empty());

    // a plain retry fetches and verifies the newer content
    let retry = h.machine.hydrate(&path, ctx()).await.unwrap();
    assert_eq!(retry, HydrationOutcome::Hydrated);
    assert_eq!(h.read(&path), b"version two");
}

#[tokio::test]
async fn test_refresh_of_moved_file_fails_into_error() {
    let h = Harness::new().await;
    let (path, item) = h.seed_file("moved.txt", b"original").await;
    h.machine.hydrate(&path, ctx()).await.unwrap();
    std::fs::rename(path.as_path(), h.path("moved (copy).txt").as_path()).unwrap();

    let updated = h
        .remote
        .update_content(&item.id, b"newer", Utc::now())
        .unwrap();
    h.remote.fail_next(RemoteCall::Download, Fault::Unknown);
    let outcome = h
        .machine
        .apply_remote_content(&path, &updated, ctx())
        .await
        .unwrap();

    assert!(matches!(outcome, HydrationOutcome::Failed(_)));
    assert_eq!(h.machine.get_state(&path).unwrap().state(), EntryState::Error);
    assert!(!path.as_path().exists());
}

#[tokio::test]
async fn test_apply_remote_content_registers_new_paths() {
    let h = Harness::new().await;
    let item = h
        .remote
        .insert_file(None, "fresh.txt", b"brand new", Utc::now())
        .unwrap();
    let path = h.path("inbox/fresh.txt");

    let outcome = h
        .machine
        .apply_remote_content(&path, &item, ctx())
        .await
        .unwrap();

    assert_eq!(outcome, HydrationOutcome::Hydrated);
    assert!(h.machine.get_state(&h.path("inbox")).unwrap().is_directory());
    assert!(h
        .driver
        .commands()
        .iter()
        .any(|c| matches!(c, DriverCommand::Create { path: p, .. } if p == &path)));
}

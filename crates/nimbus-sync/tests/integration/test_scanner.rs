//! Remote scans against the in-memory remote

use std::{sync::Arc, time::Duration};

use chrono::{Duration as ChronoDuration, Utc};
use nimbus_core::{
    classify::{ErrorKind, OpContext},
    domain::{EntryState, OperationKind},
    ports::RemoteStorage,
};
use nimbus_sync::RemoteScanner;
use nimbus_transfer::{Fault, RemoteCall};
use tokio_util::sync::CancellationToken;

use crate::common::{wait_for, Harness};

#[tokio::test]
async fn test_scan_registers_remote_tree() {
    let h = Harness::new().await;
    let docs = h.remote.insert_folder(None, "docs").unwrap();
    h.remote
        .insert_file(Some(&docs.id), "a.txt", b"alpha", Utc::now())
        .unwrap();
    h.remote
        .insert_file(None, "top.txt", b"top", Utc::now())
        .unwrap();
    let scanner = RemoteScanner::new(h.machine.clone());

    let queued = scanner.scan_and_submit(&h.orchestrator).await.unwrap();
    h.settle().await;

    assert_eq!(queued, 3);
    assert!(h.machine.get_state(&h.path("docs")).unwrap().is_directory());
    let nested = h.machine.get_state(&h.path("docs/a.txt")).unwrap();
    assert_eq!(nested.state(), EntryState::Placeholder);
    assert_eq!(nested.declared_size(), 5);
    assert!(h.machine.get_state(&h.path("top.txt")).is_some());
    assert_eq!(h.remote.calls(RemoteCall::Download), 0);

    // nothing moved since
    assert!(scanner.scan().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scan_reports_remote_change() {
    let h = Harness::new().await;
    let (path, item) = h.seed_remote("notes.txt", b"v1", Utc::now()).await;
    h.remote
        .update_content(&item.id, b"v2", Utc::now() + ChronoDuration::minutes(1))
        .unwrap();
    let scanner = RemoteScanner::new(h.machine.clone());

    let events = scanner.scan().await.unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, OperationKind::Change);
    assert_eq!(events[0].path, path);
}

#[tokio::test]
async fn test_scan_reports_topmost_deletion() {
    let h = Harness::new().await;
    let docs = h.remote.insert_folder(None, "docs").unwrap();
    h.remote
        .insert_file(Some(&docs.id), "a.txt", b"alpha", Utc::now())
        .unwrap();
    let scanner = RemoteScanner::new(h.machine.clone());
    scanner.scan_and_submit(&h.orchestrator).await.unwrap();
    h.settle().await;

    h.remote.delete(&docs.id).await.unwrap();
    let events = scanner.scan().await.unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, OperationKind::UnlinkDir);
    assert_eq!(events[0].path, h.path("docs"));

    for event in events {
        h.orchestrator.submit_remote_event(event).await.unwrap();
    }
    h.settle().await;
    assert!(h.machine.get_state(&h.path("docs")).is_none());
    assert!(h.machine.get_state(&h.path("docs/a.txt")).is_none());
}

#[tokio::test]
async fn test_failed_listing_yields_no_events() {
    let h = Harness::new().await;
    h.remote.insert_file(None, "a.txt", b"a", Utc::now()).unwrap();
    h.remote.fail_next(RemoteCall::List, Fault::Network);
    let scanner = RemoteScanner::new(h.machine.clone());

    assert!(scanner.scan().await.is_err());
    assert!(h.machine.is_empty());
}

#[tokio::test]
async fn test_stalled_listing_times_out_as_network() {
    let h = Harness::with_call_timeout(Duration::from_millis(100)).await;
    h.remote.insert_file(None, "a.txt", b"a", Utc::now()).unwrap();
    h.remote.fail_next(RemoteCall::List, Fault::Stalled);
    let scanner = RemoteScanner::new(h.machine.clone());

    let err = tokio::time::timeout(Duration::from_secs(5), scanner.scan())
        .await
        .expect("scan must not hang on a stalled listing")
        .unwrap_err();
    let classified = err.into_classified(h.machine.reporter(), &OpContext::new("scan"));
    assert_eq!(classified.kind, ErrorKind::Network);
    assert!(h.machine.is_empty());

    // the next scan goes through
    assert_eq!(scanner.scan().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_periodic_scan_picks_up_new_items() {
    let h = Harness::new().await;
    let scanner = Arc::new(RemoteScanner::new(h.machine.clone()));
    let shutdown = CancellationToken::new();
    let task = scanner.run_periodic(h.orchestrator.clone(), Duration::from_secs(1), shutdown.clone());

    h.remote
        .insert_file(None, "later.txt", b"later", Utc::now())
        .unwrap();
    let path = h.path("later.txt");
    wait_for(Duration::from_secs(5), || h.machine.get_state(&path).is_some()).await;

    shutdown.cancel();
    task.await.unwrap();
}

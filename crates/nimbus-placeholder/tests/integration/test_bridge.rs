//! Native driver callbacks flowing through the state machine

use std::time::Duration;

use nimbus_core::{
    domain::{EntryState, OperationKind, Source, SyncOperation},
    ports::DriverEvent,
};
use nimbus_placeholder::Registration;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::common::{wait_for, Harness};

struct Bridge {
    events: mpsc::Sender<DriverEvent>,
    operations: mpsc::Receiver<SyncOperation>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

fn start(h: &Harness) -> Bridge {
    let (events, events_rx) = mpsc::channel(16);
    let (operations_tx, operations) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(h.machine.clone().run_driver_events(
        events_rx,
        operations_tx,
        shutdown.clone(),
    ));
    Bridge {
        events,
        operations,
        shutdown,
        task,
    }
}

async fn next_operation(bridge: &mut Bridge) -> SyncOperation {
    tokio::time::timeout(Duration::from_secs(2), bridge.operations.recv())
        .await
        .expect("no operation forwarded")
        .expect("operation channel closed")
}

#[tokio::test]
async fn test_hydration_request_is_answered() {
    let h = Harness::new().await;
    let (path, _) = h.seed_file("opened.txt", b"read me").await;
    let bridge = start(&h);

    let (reply, answer) = oneshot::channel();
    bridge
        .events
        .send(DriverEvent::HydrationRequested {
            path: path.clone(),
            reply: Some(reply),
        })
        .await
        .unwrap();

    assert_eq!(answer.await.unwrap(), Ok(()));
    assert_eq!(h.machine.get_state(&path).unwrap().state(), EntryState::Hydrated);
    assert_eq!(h.read(&path), b"read me");

    bridge.shutdown.cancel();
    bridge.task.await.unwrap();
}

#[tokio::test]
async fn test_hydration_request_for_unknown_path_fails() {
    let h = Harness::new().await;
    let bridge = start(&h);

    let (reply, answer) = oneshot::channel();
    bridge
        .events
        .send(DriverEvent::HydrationRequested {
            path: h.path("missing.txt"),
            reply: Some(reply),
        })
        .await
        .unwrap();

    assert!(answer.await.unwrap().is_err());
    bridge.shutdown.cancel();
    bridge.task.await.unwrap();
}

#[tokio::test]
async fn test_dehydration_request_frees_space() {
    let h = Harness::new().await;
    let (path, _) = h.seed_file("big.dat", &[1u8; 512]).await;
    h.machine
        .hydrate(&path, nimbus_core::classify::OpContext::new("hydrate"))
        .await
        .unwrap();
    let bridge = start(&h);

    bridge
        .events
        .send(DriverEvent::DehydrationRequested { path: path.clone() })
        .await
        .unwrap();

    wait_for(|| h.machine.get_state(&path).map(|e| e.state()) == Some(EntryState::Dehydrated))
        .await;
    bridge.shutdown.cancel();
    bridge.task.await.unwrap();
}

#[tokio::test]
async fn test_rename_and_delete_are_forwarded() {
    let h = Harness::new().await;
    let old = h.path("draft.txt");
    let new = h.path("final.txt");
    let dir = h.path("old-projects");
    h.machine
        .register_placeholder(&old, Registration::file(3, None))
        .await
        .unwrap();
    h.machine
        .register_placeholder(&dir, Registration::directory())
        .await
        .unwrap();
    let mut bridge = start(&h);

    bridge
        .events
        .send(DriverEvent::Rename {
            old_path: old.clone(),
            new_path: new.clone(),
        })
        .await
        .unwrap();
    let moved = next_operation(&mut bridge).await;
    assert_eq!(moved.kind, OperationKind::Move);
    assert_eq!(moved.path, new);
    assert_eq!(moved.origin, Some(old.clone()));
    assert_eq!(moved.source, Source::UserAction);
    assert!(h.machine.get_state(&new).is_some());
    assert!(h.machine.get_state(&old).is_none());

    bridge
        .events
        .send(DriverEvent::Delete { path: dir.clone() })
        .await
        .unwrap();
    let deleted = next_operation(&mut bridge).await;
    assert_eq!(deleted.kind, OperationKind::UnlinkDir);
    assert_eq!(deleted.path, dir);

    drop(bridge.events);
    bridge.task.await.unwrap();
}

#[tokio::test]
async fn test_failed_rename_is_not_forwarded() {
    let h = Harness::new().await;
    let mut bridge = start(&h);

    bridge
        .events
        .send(DriverEvent::Rename {
            old_path: h.path("never-registered"),
            new_path: h.path("whatever"),
        })
        .await
        .unwrap();
    bridge
        .events
        .send(DriverEvent::Delete { path: h.path("gone.txt") })
        .await
        .unwrap();

    // Only the delete comes through
    let op = next_operation(&mut bridge).await;
    assert_eq!(op.kind, OperationKind::Unlink);

    bridge.shutdown.cancel();
    bridge.task.await.unwrap();
}

//! Registration, dehydration, pinning, renames and restart recovery

use std::path::PathBuf;

use chrono::Utc;
use nimbus_cache::MemoryMetadataStore;
use nimbus_core::{
    classify::{ErrorKind, OpContext},
    domain::{
        ContentHash, DomainError, EntryKind, EntryState, PlaceholderEntry, RemoteId, SyncPath,
    },
};
use nimbus_placeholder::{DriverCommand, PlaceholderError, Registration};
use nimbus_transfer::partial_path;
use sha2::{Digest, Sha256};

use crate::common::{temp_root, Harness};

fn ctx() -> OpContext {
    OpContext::new("test")
}

fn domain(err: PlaceholderError) -> DomainError {
    match err {
        PlaceholderError::Domain(e) => e,
        other => panic!("expected a domain error, got {other:?}"),
    }
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_register_creates_stub_and_missing_parents() {
    let h = Harness::new().await;
    let path = h.path("a/b/c.txt");

    let entry = h
        .machine
        .register_placeholder(&path, Registration::file(12, Some(Utc::now())))
        .await
        .unwrap();

    assert_eq!(entry.state(), EntryState::Placeholder);
    assert_eq!(entry.declared_size(), 12);
    assert!(h.machine.get_state(&h.path("a")).unwrap().is_directory());
    assert!(h.machine.get_state(&h.path("a/b")).unwrap().is_directory());
    assert_eq!(h.machine.len(), 3);
    assert_eq!(h.store.len(), 3);
    assert!(h.driver.contains(&path));
}

#[tokio::test]
async fn test_register_outside_root_is_rejected() {
    let h = Harness::new().await;
    let outside = SyncPath::new(PathBuf::from("/definitely/not/the/root.txt")).unwrap();

    let err = h
        .machine
        .register_placeholder(&outside, Registration::file(1, None))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PathOutsideRoot);
    assert!(matches!(domain(err), DomainError::PathOutsideRoot { .. }));
    assert!(h.machine.is_empty());
}

#[tokio::test]
async fn test_register_root_and_partial_files_is_denied() {
    let h = Harness::new().await;

    let err = h
        .machine
        .register_placeholder(&h.root, Registration::directory())
        .await
        .unwrap_err();
    assert!(matches!(domain(err), DomainError::AccessDenied(_)));

    let target = h.path("movie.mkv");
    let partial = SyncPath::new(partial_path(target.as_path())).unwrap();
    let err = h
        .machine
        .register_placeholder(&partial, Registration::file(1, None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccessDenied);
}

#[tokio::test]
async fn test_register_kind_conflicts() {
    let h = Harness::new().await;
    let file = h.path("report");
    h.machine
        .register_placeholder(&file, Registration::file(5, None))
        .await
        .unwrap();

    let same_path = h
        .machine
        .register_placeholder(&file, Registration::directory())
        .await
        .unwrap_err();
    assert!(matches!(domain(same_path), DomainError::KindConflict { .. }));

    let beneath = h
        .machine
        .register_placeholder(&h.path("report/inner.txt"), Registration::file(1, None))
        .await
        .unwrap_err();
    assert!(matches!(domain(beneath), DomainError::KindConflict { .. }));
}

#[tokio::test]
async fn test_register_refreshes_metadata() {
    let h = Harness::new().await;
    let path = h.path("grow.log");
    h.machine
        .register_placeholder(&path, Registration::file(10, None))
        .await
        .unwrap();

    let id = RemoteId::new("remote-7").unwrap();
    let entry = h
        .machine
        .register_placeholder(&path, Registration::file(20, None).with_remote_id(id.clone()))
        .await
        .unwrap();

    assert_eq!(entry.declared_size(), 20);
    assert_eq!(entry.remote_id(), Some(&id));
    assert_eq!(h.machine.find_by_remote_id(&id).unwrap().path(), &path);
}

#[tokio::test]
async fn test_register_new_hash_drops_stale_hydrated_bytes() {
    let h = Harness::new().await;
    let (path, item) = h.seed_file("stale.txt", b"old bytes").await;
    h.machine.hydrate(&path, ctx()).await.unwrap();

    let newer = ContentHash::from_digest(&Sha256::digest(b"new bytes"));
    let entry = h
        .machine
        .register_placeholder(
            &path,
            Registration::from_remote(&item).with_content_hash(newer.clone()),
        )
        .await
        .unwrap();

    assert_eq!(entry.state(), EntryState::Dehydrated);
    assert_eq!(entry.content_hash(), Some(&newer));
    assert_eq!(h.read(&path).len(), 0);
}

#[tokio::test]
async fn test_register_new_hash_on_pinned_file_is_refused() {
    let h = Harness::new().await;
    let (path, item) = h.seed_file("keep.txt", b"keep me").await;
    h.machine.hydrate(&path, ctx()).await.unwrap();
    h.machine.pin(&path).await.unwrap();

    let newer = ContentHash::from_digest(&Sha256::digest(b"other"));
    let err = h
        .machine
        .register_placeholder(&path, Registration::from_remote(&item).with_content_hash(newer))
        .await
        .unwrap_err();

    assert!(matches!(domain(err), DomainError::Pinned(_)));
    assert_eq!(h.read(&path), b"keep me");
}

// ============================================================================
// Dehydration and pinning
// ============================================================================

#[tokio::test]
async fn test_dehydrate_frees_content_and_keeps_metadata() {
    let h = Harness::new().await;
    let (path, _) = h.seed_file("video.mp4", &[5u8; 2000]).await;
    h.machine.hydrate(&path, ctx()).await.unwrap();

    let freed = h.machine.dehydrate(&path).await.unwrap();

    assert_eq!(freed, 2000);
    assert_eq!(h.read(&path).len(), 0);
    let entry = h.machine.get_state(&path).unwrap();
    assert_eq!(entry.state(), EntryState::Dehydrated);
    assert_eq!(entry.declared_size(), 2000);
    assert!(h.machine.write_log().has_recent(path.as_path()));

    // Re-hydration downloads again
    h.machine.hydrate(&path, ctx()).await.unwrap();
    assert_eq!(h.read(&path).len(), 2000);
}

#[tokio::test]
async fn test_dehydrate_nothing_to_free() {
    let h = Harness::new().await;
    let (path, _) = h.seed_file("never-opened.txt", b"abc").await;

    assert_eq!(h.machine.dehydrate(&path).await.unwrap(), 0);
    assert_eq!(
        h.machine.get_state(&path).unwrap().state(),
        EntryState::Placeholder
    );
}

#[tokio::test]
async fn test_pinned_file_cannot_be_dehydrated() {
    let h = Harness::new().await;
    let (path, _) = h.seed_file("thesis.pdf", b"chapter one").await;
    h.machine.hydrate(&path, ctx()).await.unwrap();

    let pinned = h.machine.pin(&path).await.unwrap();
    assert!(pinned.is_pinned());
    assert_eq!(pinned.state(), EntryState::Hydrated);
    assert!(h.driver.commands().iter().any(|c| matches!(
        c,
        DriverCommand::Update { pinned: true, path: p, .. } if p == &path
    )));

    let err = h.machine.dehydrate(&path).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Pinned);

    h.machine.unpin(&path).await.unwrap();
    assert_eq!(h.machine.dehydrate(&path).await.unwrap(), 11);
}

#[tokio::test]
async fn test_dehydrate_refuses_unsynced_local_changes() {
    let h = Harness::new().await;
    let (path, _) = h.seed_file("draft.md", b"# Title").await;
    h.machine.hydrate(&path, ctx()).await.unwrap();

    std::fs::write(path.as_path(), b"# Title\n\nNew paragraph").unwrap();

    let err = h.machine.dehydrate(&path).await.unwrap_err();
    assert!(matches!(domain(err), DomainError::Busy(_)));
    assert_eq!(h.machine.get_state(&path).unwrap().state(), EntryState::Hydrated);
}

// ============================================================================
// Uploads and failure markers
// ============================================================================

#[tokio::test]
async fn test_record_upload_marks_local_file_hydrated() {
    let h = Harness::new().await;
    let path = h.path("docs/new.txt");
    std::fs::create_dir_all(h.path("docs").as_path()).unwrap();
    std::fs::write(path.as_path(), b"typed locally").unwrap();
    let item = h
        .remote
        .insert_file(None, "new.txt", b"typed locally", Utc::now())
        .unwrap();
    let hash = item.content_hash.clone().unwrap();

    let entry = h
        .machine
        .record_upload(&path, &item, hash.clone(), Utc::now())
        .await
        .unwrap();

    assert_eq!(entry.state(), EntryState::Hydrated);
    assert_eq!(entry.remote_id(), Some(&item.id));
    assert_eq!(entry.content_hash(), Some(&hash));
    // No stub for a file that already exists
    assert!(!h
        .driver
        .commands()
        .iter()
        .any(|c| matches!(c, DriverCommand::Create { path: p, .. } if p == &path)));
}

#[tokio::test]
async fn test_exhausted_failure_marker_survives_until_cleared() {
    let h = Harness::new().await;
    let (path, _) = h.seed_file("stuck.txt", b"x").await;
    let classified = h
        .machine
        .reporter()
        .report(&ctx(), &anyhow::anyhow!("connection refused"));

    let entry = h.machine.record_failure(&path, &classified, true).await.unwrap();
    assert!(entry.has_exhausted_error());
    assert_eq!(entry.state(), EntryState::Placeholder);

    let cleared = h.machine.clear_error(&path).await.unwrap();
    assert!(cleared.last_error().is_none());
}

// ============================================================================
// Renames and removal
// ============================================================================

#[tokio::test]
async fn test_rename_moves_subtree_metadata() {
    let h = Harness::new().await;
    for rel in ["album/one.jpg", "album/two.jpg"] {
        h.machine
            .register_placeholder(&h.path(rel), Registration::file(1, None))
            .await
            .unwrap();
    }

    let moved = h
        .machine
        .rename(&h.path("album"), &h.path("archive/album-2025"))
        .await
        .unwrap();

    assert_eq!(moved, 3);
    assert!(h.machine.get_state(&h.path("album")).is_none());
    assert!(h.machine.get_state(&h.path("archive/album-2025/one.jpg")).is_some());
    assert!(h.machine.get_state(&h.path("archive")).unwrap().is_directory());
    assert!(h.store.get(&h.path("album/two.jpg")).is_none());
    assert!(h.store.get(&h.path("archive/album-2025/two.jpg")).is_some());
}

#[tokio::test]
async fn test_rename_unknown_path_is_not_found() {
    let h = Harness::new().await;
    let err = h
        .machine
        .rename(&h.path("nope"), &h.path("still-nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, PlaceholderError::NotFound(_)));
}

#[tokio::test]
async fn test_delete_local_removes_subtree() {
    let h = Harness::new().await;
    h.machine
        .register_placeholder(&h.path("tmp/a.txt"), Registration::file(1, None))
        .await
        .unwrap();
    h.machine
        .register_placeholder(&h.path("keep.txt"), Registration::file(1, None))
        .await
        .unwrap();

    let removed = h.machine.delete_local(&h.path("tmp")).await.unwrap();

    assert_eq!(removed, 2);
    assert_eq!(h.machine.len(), 1);
    assert!(!h.driver.contains(&h.path("tmp/a.txt")));
    assert!(h.machine.write_log().has_recent(h.path("tmp/a.txt").as_path()));
}

// ============================================================================
// Restart recovery
// ============================================================================

fn stored_entry(root: &SyncPath, rel: &str, states: &[EntryState]) -> PlaceholderEntry {
    let path = SyncPath::new(root.as_path().join(rel)).unwrap();
    let mut entry = PlaceholderEntry::new(path, EntryKind::File, 10, None);
    entry.set_remote_id(Some(RemoteId::new(format!("id-{rel}")).unwrap()));
    for state in states {
        if *state == EntryState::Hydrated {
            entry.set_local_modified(Some(Utc::now()));
        }
        entry.transition_to(*state).unwrap();
    }
    entry
}

#[tokio::test]
async fn test_load_collapses_transient_states() {
    let (dir, root) = temp_root();
    let fresh = stored_entry(&root, "fresh.bin", &[EntryState::Hydrating]);
    let again = stored_entry(
        &root,
        "again.bin",
        &[
            EntryState::Hydrating,
            EntryState::Hydrated,
            EntryState::Dehydrating,
            EntryState::Dehydrated,
            EntryState::Hydrating,
        ],
    );
    let freeing = stored_entry(
        &root,
        "freeing.bin",
        &[EntryState::Hydrating, EntryState::Hydrated, EntryState::Dehydrating],
    );
    let partial = partial_path(fresh.path().as_path());
    std::fs::write(&partial, b"half a download").unwrap();

    let h = Harness::with_store(
        dir,
        MemoryMetadataStore::with_entries([fresh.clone(), again.clone(), freeing.clone()]),
    )
    .await;

    let state = |e: &PlaceholderEntry| h.machine.get_state(e.path()).unwrap().state();
    assert_eq!(state(&fresh), EntryState::Placeholder);
    assert_eq!(state(&again), EntryState::Dehydrated);
    assert_eq!(state(&freeing), EntryState::Dehydrated);
    assert_eq!(h.store.get(fresh.path()).unwrap().state(), EntryState::Placeholder);
    assert!(!partial.exists());
}

#[tokio::test]
async fn test_load_ignores_entries_outside_root() {
    let (dir, root) = temp_root();
    let inside = stored_entry(&root, "inside.txt", &[]);
    let elsewhere = SyncPath::new(PathBuf::from("/elsewhere/file.txt")).unwrap();
    let outside = PlaceholderEntry::new(elsewhere, EntryKind::File, 1, None);

    let h = Harness::with_store(dir, MemoryMetadataStore::with_entries([inside, outside])).await;
    assert_eq!(h.machine.len(), 1);
}

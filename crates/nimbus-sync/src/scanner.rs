//! Remote scanner
//!
//! Walks the remote tree with `list`, compares it with the placeholder
//! snapshot and turns every difference into a [`RemoteEvent`]:
//!
//! - an item with no entry is an `Add` (`AddDir` for folders)
//! - a file whose id, modification time or hash moved is a `Change`
//! - a folder known under another id is an `AddDir`
//! - an item whose kind flipped is an `Unlink` of the old entry plus an `Add`
//! - a synced entry missing remotely is an `Unlink` (`UnlinkDir`), reported
//!   for the topmost missing path only
//!
//! Entries that were never uploaded carry no remote id and are left alone.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use nimbus_core::{
    classify::OpContext,
    domain::{OperationKind, PlaceholderEntry, RemoteId, RemoteItem, Source, SyncOperation, SyncPath},
    ports::RemoteStorage,
};
use nimbus_placeholder::PlaceholderStateMachine;
use nimbus_transfer::is_partial_path;
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{orchestrator::SyncOrchestrator, SyncError};

/// A change observed on the remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEvent {
    pub kind: OperationKind,
    pub path: SyncPath,
    /// Current remote metadata; `None` for deletions
    pub item: Option<RemoteItem>,
}

impl RemoteEvent {
    pub fn new(kind: OperationKind, path: SyncPath, item: Option<RemoteItem>) -> Self {
        Self { kind, path, item }
    }

    pub fn into_operation(self) -> SyncOperation {
        match self.item {
            Some(item) => SyncOperation::from_remote(self.kind, self.path, item),
            None => SyncOperation::new(self.kind, self.path, Source::RemoteFeed),
        }
    }
}

/// Diffs the remote tree against the placeholder metadata
pub struct RemoteScanner {
    remote: Arc<dyn RemoteStorage>,
    machine: Arc<PlaceholderStateMachine>,
}

impl RemoteScanner {
    pub fn new(machine: Arc<PlaceholderStateMachine>) -> Self {
        Self {
            remote: Arc::clone(machine.pipeline().remote()),
            machine,
        }
    }

    /// Lists the whole remote tree, breadth first, keyed by local path
    ///
    /// # Errors
    ///
    /// Returns `SyncError::Remote` if any listing fails or outlives the
    /// per-call deadline; a partial tree is never returned since it would
    /// read as mass deletion.
    pub async fn list_tree(&self) -> Result<Vec<(SyncPath, RemoteItem)>, SyncError> {
        let mut tree = Vec::new();
        let mut folders: VecDeque<(Option<RemoteId>, SyncPath)> = VecDeque::new();
        folders.push_back((None, self.machine.root().clone()));

        while let Some((folder_id, folder_path)) = folders.pop_front() {
            let items = self
                .machine
                .pipeline()
                .timed("list", self.remote.list(folder_id.as_ref()))
                .await
                .map_err(SyncError::Remote)?;

            for item in items {
                let path = match folder_path.join(&item.name) {
                    Ok(path) => path,
                    Err(e) => {
                        warn!(name = %item.name, error = %e, "Skipping remote item with unusable name");
                        continue;
                    }
                };
                if is_partial_path(path.as_path()) {
                    continue;
                }
                if item.is_directory() {
                    folders.push_back((Some(item.id.clone()), path.clone()));
                }
                tree.push((path, item));
            }
        }
        Ok(tree)
    }

    /// Lists the remote tree and returns what changed since the last sync
    #[instrument(skip(self))]
    pub async fn scan(&self) -> Result<Vec<RemoteEvent>, SyncError> {
        let tree = self.list_tree().await?;
        let snapshot = self.machine.snapshot();
        let events = diff(&snapshot, &tree);
        info!(remote_items = tree.len(), entries = snapshot.len(), changes = events.len(), "Remote scan finished");
        Ok(events)
    }

    /// Scans once and queues every change on `orchestrator`
    pub async fn scan_and_submit(&self, orchestrator: &SyncOrchestrator) -> Result<usize, SyncError> {
        let events = self.scan().await?;
        let count = events.len();
        for event in events {
            orchestrator.submit_remote_event(event).await?;
        }
        Ok(count)
    }

    /// Scans now and then every `period` until `shutdown` fires
    ///
    /// A failed scan is reported and the next one runs on schedule.
    pub fn run_periodic(
        self: Arc<Self>,
        orchestrator: Arc<SyncOrchestrator>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = time::interval(period.max(Duration::from_secs(1)));
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Periodic remote scan shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        match self.scan_and_submit(&orchestrator).await {
                            Ok(0) => debug!("Remote is in sync"),
                            Ok(changes) => info!(changes, "Remote changes queued"),
                            Err(SyncError::QueueClosed) => break,
                            Err(e) => {
                                let ctx = OpContext::new("remote_scan");
                                e.into_classified(self.machine.reporter(), &ctx);
                            }
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for RemoteScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteScanner")
            .field("root", self.machine.root())
            .finish_non_exhaustive()
    }
}

/// Compares placeholder entries with a listed remote tree
pub fn diff(snapshot: &[PlaceholderEntry], tree: &[(SyncPath, RemoteItem)]) -> Vec<RemoteEvent> {
    let entries: HashMap<&SyncPath, &PlaceholderEntry> =
        snapshot.iter().map(|e| (e.path(), e)).collect();
    let remote: HashMap<&SyncPath, &RemoteItem> = tree.iter().map(|(p, i)| (p, i)).collect();

    let mut sorted: Vec<&(SyncPath, RemoteItem)> = tree.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut events = Vec::new();
    for (path, item) in sorted {
        let add_kind = if item.is_directory() {
            OperationKind::AddDir
        } else {
            OperationKind::Add
        };

        let Some(entry) = entries.get(path) else {
            events.push(RemoteEvent::new(add_kind, path.clone(), Some(item.clone())));
            continue;
        };

        if entry.kind() != item.kind {
            events.push(RemoteEvent::new(unlink_kind(entry), path.clone(), None));
            events.push(RemoteEvent::new(add_kind, path.clone(), Some(item.clone())));
            continue;
        }

        let moved_on = if item.is_directory() {
            entry.remote_id() != Some(&item.id)
        } else {
            entry.remote_id() != Some(&item.id)
                || entry.remote_modified() != Some(item.modified)
                || (item.content_hash.is_some() && item.content_hash.as_ref() != entry.content_hash())
        };
        if moved_on {
            let kind = if item.is_directory() {
                OperationKind::AddDir
            } else {
                OperationKind::Change
            };
            events.push(RemoteEvent::new(kind, path.clone(), Some(item.clone())));
        }
    }

    let mut missing: Vec<&PlaceholderEntry> = snapshot
        .iter()
        .filter(|e| e.remote_id().is_some() && !remote.contains_key(e.path()))
        .collect();
    missing.sort_by(|a, b| a.path().cmp(b.path()));

    let mut removed: Vec<&SyncPath> = Vec::new();
    for entry in missing {
        if removed.iter().any(|r| entry.path().is_descendant_of(r)) {
            continue;
        }
        removed.push(entry.path());
        events.push(RemoteEvent::new(unlink_kind(entry), entry.path().clone(), None));
    }

    events
}

fn unlink_kind(entry: &PlaceholderEntry) -> OperationKind {
    if entry.is_directory() {
        OperationKind::UnlinkDir
    } else {
        OperationKind::Unlink
    }
}

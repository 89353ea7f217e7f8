//! Placeholder state machine.
//!
//! Canonical owner of every [`PlaceholderEntry`]. All mutation goes through
//! the operations defined here; other components read snapshots.
//!
//! ## Architecture
//!
//! ```text
//!  Orchestrator ──┐                          ┌──► NativeDriver
//!                 │   ┌──────────────────┐   │   (create/update/delete,
//!  DriverEvent ───┼──►│ PlaceholderState │───┤    report_progress)
//!   (mpsc)        │   │     Machine      │   │
//!                 │   │                  │   ├──► MetadataStore
//!  Reclaim sweep ─┘   │ entries: arena   │   │   (save on every transition)
//!                     │ locks: per path  │   │
//!                     │ inflight: joins  │   └──► TransferPipeline
//!                     └──────────────────┘        (download, write log)
//! ```
//!
//! ## Concurrency
//!
//! - Mutation of one path is serialized by a per-path async mutex. The lock
//!   is held while state changes, never across a network transfer.
//! - A hydration registers itself in `inflight` before releasing the lock.
//!   Later callers for the same path subscribe to its outcome instead of
//!   starting a second download.
//! - `Hydrating` is visible while the download runs, so `dehydrate` and
//!   `register_placeholder` answer `Busy` rather than waiting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use nimbus_core::{
    classify::{ClassifiedError, ErrorReporter, OpContext},
    domain::{
        ContentHash, DomainError, EntryKind, EntryState, LastError, OperationKind,
        PlaceholderEntry, RemoteId, RemoteItem, Source, SyncOperation, SyncPath,
    },
    ports::{DriverEvent, MetadataStore, NativeDriver},
};
use nimbus_transfer::{is_partial_path, partial_path, Fingerprint, TransferPipeline, WriteLog};
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PlaceholderError;

// ============================================================================
// Public types
// ============================================================================

/// Result of a hydration request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HydrationOutcome {
    /// Content was downloaded and published
    Hydrated,
    /// Content was already on disk; nothing was transferred
    AlreadyHydrated,
    /// The transfer was cancelled; the entry is back in its prior state
    Aborted,
    /// The transfer failed; `last_error` is set on the entry
    Failed(ClassifiedError),
}

impl HydrationOutcome {
    /// Returns true if content is on disk after the request
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            HydrationOutcome::Hydrated | HydrationOutcome::AlreadyHydrated
        )
    }

    /// Converts into the reply sent back to the native layer
    pub fn into_reply(self) -> Result<(), String> {
        match self {
            HydrationOutcome::Hydrated | HydrationOutcome::AlreadyHydrated => Ok(()),
            HydrationOutcome::Aborted => Err("hydration aborted".to_string()),
            HydrationOutcome::Failed(e) => Err(e.to_string()),
        }
    }
}

/// What the caller knows about an item being registered
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub remote_id: Option<RemoteId>,
    pub content_hash: Option<ContentHash>,
}

impl Registration {
    pub fn file(size: u64, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            kind: EntryKind::File,
            size,
            modified,
            remote_id: None,
            content_hash: None,
        }
    }

    pub fn directory() -> Self {
        Self {
            kind: EntryKind::Directory,
            size: 0,
            modified: None,
            remote_id: None,
            content_hash: None,
        }
    }

    /// Registration describing a remote item
    pub fn from_remote(item: &RemoteItem) -> Self {
        Self {
            kind: item.kind,
            size: item.size,
            modified: Some(item.modified),
            remote_id: Some(item.id.clone()),
            content_hash: item.content_hash.clone(),
        }
    }

    pub fn with_remote_id(mut self, id: RemoteId) -> Self {
        self.remote_id = Some(id);
        self
    }

    pub fn with_content_hash(mut self, hash: ContentHash) -> Self {
        self.content_hash = Some(hash);
        self
    }
}

struct InFlight {
    outcome: watch::Receiver<Option<HydrationOutcome>>,
    cancel: CancellationToken,
}

/// Where a hydration reads its content from
struct Target {
    remote_id: RemoteId,
    expected: Option<ContentHash>,
    size: u64,
    /// Content replaces a hydrated file, whose old bytes are dropped first
    refresh: bool,
}

// ============================================================================
// PlaceholderStateMachine
// ============================================================================

/// Owns placeholder metadata and drives hydration and dehydration
pub struct PlaceholderStateMachine {
    root: SyncPath,
    entries: DashMap<SyncPath, PlaceholderEntry>,
    locks: DashMap<SyncPath, Arc<Mutex<()>>>,
    inflight: DashMap<SyncPath, InFlight>,
    driver: Arc<dyn NativeDriver>,
    store: Arc<dyn MetadataStore>,
    pipeline: Arc<TransferPipeline>,
    reporter: ErrorReporter,
    shutdown: CancellationToken,
}

impl PlaceholderStateMachine {
    /// Creates an empty state machine for `root`
    ///
    /// Call [`load`](Self::load) before use to restore persisted entries.
    pub fn new(
        root: SyncPath,
        driver: Arc<dyn NativeDriver>,
        store: Arc<dyn MetadataStore>,
        pipeline: Arc<TransferPipeline>,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            root,
            entries: DashMap::new(),
            locks: DashMap::new(),
            inflight: DashMap::new(),
            driver,
            store,
            pipeline,
            reporter,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn root(&self) -> &SyncPath {
        &self.root
    }

    pub fn pipeline(&self) -> &Arc<TransferPipeline> {
        &self.pipeline
    }

    pub fn write_log(&self) -> &Arc<WriteLog> {
        self.pipeline.write_log()
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    /// Restores persisted entries, collapsing transient states
    ///
    /// Leftover temporary download files of collapsed entries are removed.
    ///
    /// # Errors
    ///
    /// Returns `PlaceholderError::Store` if the store cannot be read or a
    /// collapsed entry cannot be written back.
    pub async fn load(&self) -> Result<usize, PlaceholderError> {
        let stored = self.store.load_all().await.map_err(PlaceholderError::Store)?;
        let mut loaded = 0usize;
        let mut collapsed = 0usize;

        for mut entry in stored {
            if !entry.path().is_within(&self.root) {
                warn!(path = %entry.path(), root = %self.root, "Ignoring entry outside sync root");
                continue;
            }

            let before = entry.state();
            if entry.collapse_transient() {
                info!(
                    path = %entry.path(),
                    from = %before,
                    to = %entry.state(),
                    "Collapsed transient state after restart"
                );
                self.persist(&entry).await?;
                discard_partial(entry.path()).await;
                collapsed += 1;
            }

            self.entries.insert(entry.path().clone(), entry);
            loaded += 1;
        }

        info!(loaded, collapsed, "Placeholder metadata restored");
        Ok(loaded)
    }

    /// Cancels every in-flight hydration
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Snapshot of the entry at `path`
    pub fn get_state(&self, path: &SyncPath) -> Option<PlaceholderEntry> {
        self.entries.get(path).map(|e| e.clone())
    }

    /// Snapshot of every entry, ordered by path
    pub fn snapshot(&self) -> Vec<PlaceholderEntry> {
        let mut all: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.path().cmp(b.path()));
        all
    }

    /// Entry whose remote identifier is `id`
    pub fn find_by_remote_id(&self, id: &RemoteId) -> Option<PlaceholderEntry> {
        self.entries
            .iter()
            .find(|e| e.remote_id() == Some(id))
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if a hydration runs at `path` or beneath it
    pub fn is_busy(&self, path: &SyncPath) -> bool {
        self.inflight.iter().any(|f| f.key().is_within(path))
    }

    /// Cancels the hydration running at `path`, if any
    pub fn cancel_hydration(&self, path: &SyncPath) -> bool {
        match self.inflight.get(path) {
            Some(flight) => {
                flight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Creates or refreshes the entry at `path`
    ///
    /// New entries start in `Placeholder` and get a native stub; missing
    /// ancestor directories are registered first. An existing hydrated file
    /// whose content hash changed is dehydrated so the stale bytes are not
    /// served.
    ///
    /// # Errors
    ///
    /// - `PathOutsideRoot` if `path` is not under the sync root
    /// - `AccessDenied` for the sync root itself and reserved transfer files
    /// - `KindConflict` if `path` or an ancestor is registered with another kind
    /// - `Busy` while a transfer runs for the entry
    /// - `Pinned` if a pinned hydrated file would have to be dehydrated
    pub async fn register_placeholder(
        &self,
        path: &SyncPath,
        registration: Registration,
    ) -> Result<PlaceholderEntry, PlaceholderError> {
        self.check_access(path)?;
        self.check_ancestors(path)?;
        self.ensure_parents(path).await?;

        let _guard = self.lock(path).await;
        match self.get_state(path) {
            None => self.create_entry(path, registration).await,
            Some(existing) => self.refresh_entry(existing, registration).await,
        }
    }

    fn check_access(&self, path: &SyncPath) -> Result<(), DomainError> {
        if !path.is_within(&self.root) {
            return Err(DomainError::PathOutsideRoot {
                path: path.to_string(),
                root: self.root.to_string(),
            });
        }
        if path == &self.root || is_partial_path(path.as_path()) {
            return Err(DomainError::AccessDenied(path.to_string()));
        }
        Ok(())
    }

    fn check_ancestors(&self, path: &SyncPath) -> Result<(), DomainError> {
        let mut current = path.parent();
        while let Some(ancestor) = current {
            if !ancestor.is_descendant_of(&self.root) {
                break;
            }
            if let Some(entry) = self.entries.get(&ancestor) {
                if !entry.is_directory() {
                    return Err(DomainError::KindConflict {
                        path: ancestor.to_string(),
                        existing: EntryKind::File.to_string(),
                        requested: EntryKind::Directory.to_string(),
                    });
                }
            }
            current = ancestor.parent();
        }
        Ok(())
    }

    async fn ensure_parents(&self, path: &SyncPath) -> Result<(), PlaceholderError> {
        let mut missing = Vec::new();
        let mut current = path.parent();
        while let Some(ancestor) = current {
            if !ancestor.is_descendant_of(&self.root) || self.entries.contains_key(&ancestor) {
                break;
            }
            current = ancestor.parent();
            missing.push(ancestor);
        }

        for ancestor in missing.into_iter().rev() {
            let _guard = self.lock(&ancestor).await;
            if !self.entries.contains_key(&ancestor) {
                self.create_entry(&ancestor, Registration::directory()).await?;
            }
        }
        Ok(())
    }

    async fn create_entry(
        &self,
        path: &SyncPath,
        registration: Registration,
    ) -> Result<PlaceholderEntry, PlaceholderError> {
        let mut entry = PlaceholderEntry::new(
            path.clone(),
            registration.kind,
            registration.size,
            registration.modified,
        );
        entry.set_remote_id(registration.remote_id);
        entry.set_content_hash(registration.content_hash);

        let existed = tokio::fs::try_exists(path.as_path()).await.unwrap_or(false);
        if !existed {
            let fingerprint = if entry.is_directory() {
                Fingerprint::Directory
            } else {
                Fingerprint::Content(ContentHash::empty())
            };
            self.write_log().record(path.as_path(), fingerprint);
        }

        if let Err(e) = self.driver.create_placeholder(&entry).await {
            if !existed {
                self.write_log().forget(path.as_path());
            }
            return Err(PlaceholderError::Driver(e));
        }

        self.entries.insert(path.clone(), entry.clone());
        self.persist(&entry).await?;
        info!(path = %path, kind = %entry.kind(), "Placeholder registered");
        Ok(entry)
    }

    async fn refresh_entry(
        &self,
        existing: PlaceholderEntry,
        registration: Registration,
    ) -> Result<PlaceholderEntry, PlaceholderError> {
        let path = existing.path().clone();
        if existing.kind() != registration.kind {
            return Err(DomainError::KindConflict {
                path: path.to_string(),
                existing: existing.kind().to_string(),
                requested: registration.kind.to_string(),
            }
            .into());
        }
        if existing.state().is_transient() || self.inflight.contains_key(&path) {
            return Err(DomainError::Busy(path.to_string()).into());
        }

        let stale = existing.state() == EntryState::Hydrated
            && registration.content_hash.is_some()
            && registration.content_hash.as_ref() != existing.content_hash();
        if stale {
            if existing.is_pinned() {
                return Err(DomainError::Pinned(path.to_string()).into());
            }
            debug!(path = %path, "Remote content changed, dropping stale local bytes");
            self.dehydrate_locked(&path).await?;
        }

        let hydrated = self.get_state(&path).map(|e| e.state()) == Some(EntryState::Hydrated);
        let entry = self
            .update(&path, |e| {
                if let Some(id) = registration.remote_id {
                    e.set_remote_id(Some(id));
                }
                if registration.modified.is_some() {
                    e.set_remote_modified(registration.modified);
                }
                if !hydrated {
                    e.set_declared_size(registration.size);
                    if registration.content_hash.is_some() {
                        e.set_content_hash(registration.content_hash);
                    }
                }
                Ok(())
            })
            .await?;
        self.notify_driver(&entry).await;
        Ok(entry)
    }

    /// Records a completed upload of local content at `path`
    ///
    /// The entry is created if needed (the file already exists locally, so
    /// no stub is made) and brought to `Hydrated` through `Hydrating`.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if a hydration runs for the entry.
    pub async fn record_upload(
        &self,
        path: &SyncPath,
        item: &RemoteItem,
        content_hash: ContentHash,
        local_modified: DateTime<Utc>,
    ) -> Result<PlaceholderEntry, PlaceholderError> {
        self.check_access(path)?;
        self.check_ancestors(path)?;
        self.ensure_parents(path).await?;

        let _guard = self.lock(path).await;
        if self.inflight.contains_key(path) {
            return Err(DomainError::Busy(path.to_string()).into());
        }

        if !self.entries.contains_key(path) {
            let entry = PlaceholderEntry::new(path.clone(), item.kind, item.size, Some(item.modified));
            self.entries.insert(path.clone(), entry);
        }

        let mut entry = self
            .update(path, |e| {
                if e.kind() != item.kind {
                    return Err(DomainError::KindConflict {
                        path: path.to_string(),
                        existing: e.kind().to_string(),
                        requested: item.kind.to_string(),
                    });
                }
                e.set_remote_id(Some(item.id.clone()));
                e.set_remote_modified(Some(item.modified));
                e.set_local_modified(Some(local_modified));
                e.clear_last_error();
                if !e.is_directory() {
                    e.set_content_hash(Some(content_hash));
                    e.set_declared_size(item.size);
                }
                Ok(())
            })
            .await?;

        if !entry.is_directory() {
            if entry.state().is_hydratable() {
                self.update(path, |e| e.transition_to(EntryState::Hydrating)).await?;
            }
            if entry.state() != EntryState::Hydrated {
                entry = self.update(path, |e| e.transition_to(EntryState::Hydrated)).await?;
            }
        }

        self.notify_driver(&entry).await;
        info!(path = %path, remote_id = %item.id, "Upload recorded");
        Ok(entry)
    }

    // ========================================================================
    // Hydration
    // ========================================================================

    /// Materializes the content of `path`
    ///
    /// Idempotent: an already hydrated entry returns
    /// [`HydrationOutcome::AlreadyHydrated`] without any network call.
    /// Concurrent calls for the same path share one transfer.
    ///
    /// # Errors
    ///
    /// Only precondition failures are returned as errors (`NotFound`,
    /// `Busy`, an entry without remote identifier). Transfer failures come
    /// back as [`HydrationOutcome::Failed`] after being classified and
    /// logged once.
    pub async fn hydrate(
        &self,
        path: &SyncPath,
        ctx: OpContext,
    ) -> Result<HydrationOutcome, PlaceholderError> {
        self.fetch(path, None, ctx).await
    }

    /// Publishes new remote content at `path`
    ///
    /// An unregistered path is registered first. A hydrated file first
    /// drops its superseded bytes (`Hydrated` -> `Dehydrating` ->
    /// `Dehydrated`) and then hydrates like any other entry: a failed
    /// download leaves it in `Error`, an aborted one in `Dehydrated`.
    ///
    /// # Errors
    ///
    /// Same as [`register_placeholder`](Self::register_placeholder) and
    /// [`hydrate`](Self::hydrate).
    pub async fn apply_remote_content(
        &self,
        path: &SyncPath,
        item: &RemoteItem,
        ctx: OpContext,
    ) -> Result<HydrationOutcome, PlaceholderError> {
        if !self.entries.contains_key(path) {
            self.register_placeholder(path, Registration::from_remote(item))
                .await?;
        }
        self.fetch(path, Some(item), ctx).await
    }

    async fn fetch(
        &self,
        path: &SyncPath,
        item: Option<&RemoteItem>,
        ctx: OpContext,
    ) -> Result<HydrationOutcome, PlaceholderError> {
        if let Some(rx) = self.inflight.get(path).map(|f| f.outcome.clone()) {
            debug!(path = %path, "Joining in-flight hydration");
            return Ok(join(rx).await);
        }

        let guard = self.lock(path).await;
        if let Some(rx) = self.inflight.get(path).map(|f| f.outcome.clone()) {
            drop(guard);
            return Ok(join(rx).await);
        }
        let entry = self
            .get_state(path)
            .ok_or_else(|| PlaceholderError::not_found(path))?;

        if entry.is_directory() {
            return Ok(HydrationOutcome::AlreadyHydrated);
        }
        if let Some(item) = item {
            if item.kind != entry.kind() {
                return Err(DomainError::KindConflict {
                    path: path.to_string(),
                    existing: entry.kind().to_string(),
                    requested: item.kind.to_string(),
                }
                .into());
            }
        }

        let target = match self.plan(&entry, item)? {
            Some(target) => target,
            None => return Ok(HydrationOutcome::AlreadyHydrated),
        };

        let (outcome_tx, cancel) = match self.inflight.entry(path.clone()) {
            Entry::Occupied(occupied) => {
                let rx = occupied.get().outcome.clone();
                drop(occupied);
                drop(guard);
                return Ok(join(rx).await);
            }
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                let cancel = self.shutdown.child_token();
                vacant.insert(InFlight {
                    outcome: rx,
                    cancel: cancel.clone(),
                });
                (tx, cancel)
            }
        };

        let prior = entry.state();
        if let Err(e) = self.enter_hydrating(path, target.refresh).await {
            self.inflight.remove(path);
            return Err(e);
        }
        drop(guard);

        let result = self.download(path, &target, &cancel).await;

        let _guard = self.lock(path).await;
        let outcome = self.finish(path, item, prior, result, &ctx).await;
        outcome_tx.send_replace(Some(outcome.clone()));
        self.inflight.remove(path);
        Ok(outcome)
    }

    /// Decides what to download, `None` when nothing needs to move
    fn plan(
        &self,
        entry: &PlaceholderEntry,
        item: Option<&RemoteItem>,
    ) -> Result<Option<Target>, PlaceholderError> {
        let path = entry.path();
        let state = entry.state();

        if state.is_transient() {
            return Err(DomainError::Busy(path.to_string()).into());
        }

        let target = match item {
            None if state == EntryState::Hydrated => return Ok(None),
            None => {
                let remote_id = entry.remote_id().cloned().ok_or_else(|| {
                    DomainError::ValidationFailed(format!("{path} has no remote identifier"))
                })?;
                Target {
                    remote_id,
                    expected: entry.content_hash().cloned(),
                    size: entry.declared_size(),
                    refresh: false,
                }
            }
            Some(item) => {
                let refresh = state == EntryState::Hydrated;
                if refresh
                    && item.content_hash.is_some()
                    && item.content_hash.as_ref() == entry.content_hash()
                {
                    return Ok(None);
                }
                Target {
                    remote_id: item.id.clone(),
                    expected: item.content_hash.clone(),
                    size: item.size,
                    refresh,
                }
            }
        };

        if !target.refresh && !state.is_hydratable() {
            return Err(DomainError::InvalidState {
                from: state.name().to_string(),
                to: EntryState::Hydrating.name().to_string(),
            }
            .into());
        }
        Ok(Some(target))
    }

    async fn enter_hydrating(&self, path: &SyncPath, release: bool) -> Result<(), PlaceholderError> {
        if release {
            self.release_content(path).await?;
        }
        let entry = self
            .update(path, |e| e.transition_to(EntryState::Hydrating))
            .await?;
        self.notify_driver(&entry).await;
        Ok(())
    }

    /// Drops the superseded bytes of a hydrated file ahead of a refresh
    ///
    /// A file already moved away (a conflict copy) has nothing to truncate.
    async fn release_content(&self, path: &SyncPath) -> Result<(), PlaceholderError> {
        self.update(path, |e| e.transition_to(EntryState::Dehydrating))
            .await?;

        let result = match tokio::fs::metadata(path.as_path()).await {
            Ok(_) => {
                let writes = self.write_log();
                writes.record(path.as_path(), Fingerprint::Content(ContentHash::empty()));
                let truncated = truncate(path).await;
                if truncated.is_err() {
                    writes.forget(path.as_path());
                }
                truncated
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(path = %path, error = %e, "Could not release content, keeping it");
            self.update(path, |e| e.transition_to(EntryState::Hydrated))
                .await?;
            return Err(e.into());
        }

        self.update(path, |e| e.transition_to(EntryState::Dehydrated))
            .await?;
        debug!(path = %path, "Released superseded content");
        Ok(())
    }

    async fn download(
        &self,
        path: &SyncPath,
        target: &Target,
        cancel: &CancellationToken,
    ) -> anyhow::Result<nimbus_transfer::DownloadReceipt> {
        let (progress_tx, mut progress_rx) = watch::channel(0.0f64);
        let driver = Arc::clone(&self.driver);
        let progress_path = path.clone();
        let forwarder = tokio::spawn(async move {
            let mut last = None;
            while progress_rx.changed().await.is_ok() {
                let fraction = *progress_rx.borrow_and_update();
                report(&driver, &progress_path, fraction).await;
                last = Some(fraction);
            }
            let fraction = *progress_rx.borrow();
            if last != Some(fraction) && fraction > 0.0 {
                report(&driver, &progress_path, fraction).await;
            }
        });

        let result = self
            .pipeline
            .download(
                &target.remote_id,
                path.as_path(),
                target.expected.as_ref(),
                target.size,
                cancel,
                &move |fraction| {
                    progress_tx.send_replace(fraction);
                },
            )
            .await;

        if let Err(e) = forwarder.await {
            debug!(path = %path, error = %e, "Progress forwarder ended abnormally");
        }
        result
    }

    async fn finish(
        &self,
        path: &SyncPath,
        item: Option<&RemoteItem>,
        prior: EntryState,
        result: anyhow::Result<nimbus_transfer::DownloadReceipt>,
        ctx: &OpContext,
    ) -> HydrationOutcome {
        let (outcome, update) = match result {
            Ok(receipt) => {
                let update = self
                    .update(path, |e| {
                        e.set_content_hash(Some(receipt.content_hash));
                        e.set_declared_size(receipt.size);
                        e.set_local_modified(Some(Utc::now()));
                        e.clear_last_error();
                        if let Some(item) = item {
                            e.set_remote_id(Some(item.id.clone()));
                            e.set_remote_modified(Some(item.modified));
                        }
                        e.transition_to(EntryState::Hydrated)
                    })
                    .await;
                (HydrationOutcome::Hydrated, update)
            }
            Err(err) => {
                let classified = self.reporter.report(ctx, &err);
                if classified.is_aborted() {
                    // released content is gone, the entry cannot return to Hydrated
                    let revert = if prior == EntryState::Hydrated {
                        EntryState::Dehydrated
                    } else {
                        prior
                    };
                    let update = self.update(path, |e| e.transition_to(revert)).await;
                    (HydrationOutcome::Aborted, update)
                } else {
                    let update = self
                        .update(path, |e| {
                            e.set_last_error(LastError::from(&classified));
                            // a later retry verifies against the content it failed to fetch
                            if let Some(item) = item {
                                e.set_remote_id(Some(item.id.clone()));
                                if item.content_hash.is_some() {
                                    e.set_content_hash(item.content_hash.clone());
                                }
                                e.set_declared_size(item.size);
                            }
                            e.transition_to(EntryState::Error)
                        })
                        .await;
                    (HydrationOutcome::Failed(classified), update)
                }
            }
        };

        match update {
            Ok(entry) => self.notify_driver(&entry).await,
            Err(e) => warn!(path = %path, error = %e, "Could not record hydration result"),
        }
        outcome
    }

    // ========================================================================
    // Dehydration
    // ========================================================================

    /// Removes the on-disk bytes of `path`, keeping its metadata
    ///
    /// Returns the number of bytes freed; entries that hold no content
    /// (directories, placeholders, already dehydrated files) free nothing.
    ///
    /// # Errors
    ///
    /// - `Pinned` if the entry is pinned
    /// - `Busy` if a transfer runs for it or the local file differs from the
    ///   synced size (changes not yet uploaded)
    pub async fn dehydrate(&self, path: &SyncPath) -> Result<u64, PlaceholderError> {
        let _guard = self.lock(path).await;
        self.dehydrate_locked(path).await
    }

    async fn dehydrate_locked(&self, path: &SyncPath) -> Result<u64, PlaceholderError> {
        let entry = self
            .get_state(path)
            .ok_or_else(|| PlaceholderError::not_found(path))?;

        if entry.is_directory() {
            return Ok(0);
        }
        if entry.is_pinned() {
            return Err(DomainError::Pinned(path.to_string()).into());
        }
        if entry.state().is_transient() || self.inflight.contains_key(path) {
            return Err(DomainError::Busy(path.to_string()).into());
        }
        if entry.state() != EntryState::Hydrated {
            return Ok(0);
        }

        let on_disk = tokio::fs::metadata(path.as_path()).await?.len();
        if on_disk != entry.declared_size() {
            debug!(path = %path, on_disk, declared = entry.declared_size(), "Local changes pending");
            return Err(DomainError::Busy(path.to_string()).into());
        }

        self.update(path, |e| e.transition_to(EntryState::Dehydrating))
            .await?;

        let writes = self.write_log();
        writes.record(path.as_path(), Fingerprint::Content(ContentHash::empty()));

        match truncate(path).await {
            Ok(()) => {
                let entry = self
                    .update(path, |e| e.transition_to(EntryState::Dehydrated))
                    .await?;
                self.notify_driver(&entry).await;
                info!(path = %path, freed_bytes = on_disk, "Dehydrated file");
                Ok(on_disk)
            }
            Err(e) => {
                writes.forget(path.as_path());
                warn!(path = %path, error = %e, "Dehydration failed, keeping content");
                self.update(path, |e| e.transition_to(EntryState::Hydrated))
                    .await?;
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // Pinning and error markers
    // ========================================================================

    /// Marks `path` as pinned; no state transition happens here
    pub async fn pin(&self, path: &SyncPath) -> Result<PlaceholderEntry, PlaceholderError> {
        self.set_pinned(path, true).await
    }

    /// Clears the pin of `path`
    pub async fn unpin(&self, path: &SyncPath) -> Result<PlaceholderEntry, PlaceholderError> {
        self.set_pinned(path, false).await
    }

    async fn set_pinned(
        &self,
        path: &SyncPath,
        pinned: bool,
    ) -> Result<PlaceholderEntry, PlaceholderError> {
        let _guard = self.lock(path).await;
        let entry = self
            .update(path, |e| {
                e.set_pinned(pinned);
                Ok(())
            })
            .await?;
        self.notify_driver(&entry).await;
        info!(path = %path, pinned, "Pin flag changed");
        Ok(entry)
    }

    /// Records a classified failure against `path`
    ///
    /// With `exhausted` set the marker stays until a user action succeeds.
    pub async fn record_failure(
        &self,
        path: &SyncPath,
        error: &ClassifiedError,
        exhausted: bool,
    ) -> Result<PlaceholderEntry, PlaceholderError> {
        let _guard = self.lock(path).await;
        let mut marker = LastError::from(error);
        if exhausted {
            marker = marker.exhausted();
        }
        let entry = self
            .update(path, |e| {
                e.set_last_error(marker);
                Ok(())
            })
            .await?;
        self.notify_driver(&entry).await;
        Ok(entry)
    }

    /// Clears the failure marker of `path`
    pub async fn clear_error(&self, path: &SyncPath) -> Result<PlaceholderEntry, PlaceholderError> {
        let _guard = self.lock(path).await;
        self.update(path, |e| {
            e.clear_last_error();
            Ok(())
        })
        .await
    }

    /// Stores the local modification time observed for `path`
    pub async fn touch_local(
        &self,
        path: &SyncPath,
        modified: DateTime<Utc>,
    ) -> Result<PlaceholderEntry, PlaceholderError> {
        let _guard = self.lock(path).await;
        self.update(path, |e| {
            e.set_local_modified(Some(modified));
            Ok(())
        })
        .await
    }

    // ========================================================================
    // Renames and removal
    // ========================================================================

    /// Re-keys the subtree at `old` under `new`
    ///
    /// The native layer has already moved the bytes; only metadata moves
    /// here. An entry already registered at `new` is replaced.
    ///
    /// # Errors
    ///
    /// `Busy` while a hydration runs inside either subtree, plus the access
    /// checks of [`register_placeholder`](Self::register_placeholder).
    pub async fn rename(&self, old: &SyncPath, new: &SyncPath) -> Result<usize, PlaceholderError> {
        if old == new {
            return Ok(0);
        }
        self.check_access(old)?;
        self.check_access(new)?;
        if self.is_busy(old) || self.is_busy(new) {
            return Err(DomainError::Busy(old.to_string()).into());
        }
        if !self.entries.contains_key(old) {
            return Err(PlaceholderError::not_found(old));
        }
        self.check_ancestors(new)?;
        self.ensure_parents(new).await?;

        let (_first, _second) = if old < new {
            (self.lock(old).await, self.lock(new).await)
        } else {
            let second = self.lock(new).await;
            (self.lock(old).await, second)
        };

        if !new.is_within(old) {
            self.forget_subtree(new).await?;
        }

        let keys: Vec<SyncPath> = self
            .entries
            .iter()
            .filter(|e| e.key().is_within(old))
            .map(|e| e.key().clone())
            .collect();

        for key in &keys {
            let Some((_, mut entry)) = self.entries.remove(key) else {
                continue;
            };
            let moved = key.rebase(old, new)?;
            entry.set_path(moved.clone());
            self.store.delete(key).await.map_err(PlaceholderError::Store)?;
            self.persist(&entry).await?;
            self.entries.insert(moved, entry);
            self.locks.remove(key);
        }

        info!(from = %old, to = %new, entries = keys.len(), "Placeholder subtree renamed");
        Ok(keys.len())
    }

    /// Drops the metadata of `path` and everything beneath it
    ///
    /// Running hydrations inside the subtree are cancelled. Nothing on disk
    /// is touched.
    pub async fn forget(&self, path: &SyncPath) -> Result<usize, PlaceholderError> {
        let _guard = self.lock(path).await;
        self.forget_subtree(path).await
    }

    /// Removes `path` from disk through the native driver and drops its
    /// metadata
    pub async fn delete_local(&self, path: &SyncPath) -> Result<usize, PlaceholderError> {
        self.check_access(path)?;
        let _guard = self.lock(path).await;

        let writes = self.write_log();
        let subtree: Vec<SyncPath> = self
            .entries
            .iter()
            .filter(|e| e.key().is_within(path))
            .map(|e| e.key().clone())
            .collect();
        writes.record(path.as_path(), Fingerprint::Removed);
        for key in &subtree {
            writes.record(key.as_path(), Fingerprint::Removed);
        }

        self.driver
            .delete_placeholder(path)
            .await
            .map_err(PlaceholderError::Driver)?;
        self.forget_subtree(path).await
    }

    async fn forget_subtree(&self, path: &SyncPath) -> Result<usize, PlaceholderError> {
        for flight in self.inflight.iter().filter(|f| f.key().is_within(path)) {
            flight.cancel.cancel();
        }

        let keys: Vec<SyncPath> = self
            .entries
            .iter()
            .filter(|e| e.key().is_within(path))
            .map(|e| e.key().clone())
            .collect();

        for key in &keys {
            self.entries.remove(key);
            self.store.delete(key).await.map_err(PlaceholderError::Store)?;
            if key != path {
                self.locks.remove(key);
            }
        }

        if !keys.is_empty() {
            info!(path = %path, entries = keys.len(), "Placeholder metadata removed");
        }
        Ok(keys.len())
    }

    // ========================================================================
    // Native driver bridge
    // ========================================================================

    /// Consumes native driver callbacks until `shutdown` fires or the
    /// channel closes
    ///
    /// Hydration and dehydration requests run here; renames and deletes
    /// are applied to metadata (renames) and forwarded to the orchestrator
    /// as [`SyncOperation`]s.
    pub async fn run_driver_events(
        self: Arc<Self>,
        mut events: mpsc::Receiver<DriverEvent>,
        operations: mpsc::Sender<SyncOperation>,
        shutdown: CancellationToken,
    ) {
        info!("Native driver bridge started");

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            debug!(path = %event.path(), "Native driver event");

            let forward = match event {
                DriverEvent::HydrationRequested { path, reply } => {
                    let machine = Arc::clone(&self);
                    tokio::spawn(async move {
                        let ctx = OpContext::new("hydrate").with_path(&path);
                        let result = match machine.hydrate(&path, ctx).await {
                            Ok(outcome) => outcome.into_reply(),
                            Err(e) => Err(e.to_string()),
                        };
                        if let Some(reply) = reply {
                            if reply.send(result).is_err() {
                                debug!(path = %path, "Hydration requester went away");
                            }
                        }
                    });
                    None
                }
                DriverEvent::DehydrationRequested { path } => {
                    let machine = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = machine.dehydrate(&path).await {
                            warn!(path = %path, kind = %e.kind(), error = %e, "Dehydration request refused");
                        }
                    });
                    None
                }
                DriverEvent::Rename { old_path, new_path } => {
                    match self.rename(&old_path, &new_path).await {
                        Ok(_) => Some(SyncOperation::moved(old_path, new_path, Source::UserAction)),
                        Err(e) => {
                            warn!(from = %old_path, to = %new_path, error = %e, "Rename not applied");
                            None
                        }
                    }
                }
                DriverEvent::Delete { path } => {
                    let kind = match self.get_state(&path) {
                        Some(entry) if entry.is_directory() => OperationKind::UnlinkDir,
                        _ => OperationKind::Unlink,
                    };
                    Some(SyncOperation::new(kind, path, Source::UserAction))
                }
            };

            if let Some(operation) = forward {
                if operations.send(operation).await.is_err() {
                    warn!("Operation queue closed, stopping native driver bridge");
                    break;
                }
            }
        }

        info!("Native driver bridge stopped");
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn lock(&self, path: &SyncPath) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(self.locks.entry(path.clone()).or_default().value());
        lock.lock_owned().await
    }

    /// Applies `f` to a copy of the entry, then stores and persists it
    ///
    /// The entry is left untouched if `f` fails.
    async fn update<F>(&self, path: &SyncPath, f: F) -> Result<PlaceholderEntry, PlaceholderError>
    where
        F: FnOnce(&mut PlaceholderEntry) -> Result<(), DomainError>,
    {
        let (from, snapshot) = {
            let mut slot = self
                .entries
                .get_mut(path)
                .ok_or_else(|| PlaceholderError::not_found(path))?;
            let from = slot.state();
            let mut draft = slot.clone();
            f(&mut draft)?;
            *slot = draft.clone();
            (from, draft)
        };

        if snapshot.state() != from {
            info!(
                path = %path,
                from = %from,
                to = %snapshot.state(),
                "Placeholder state transition"
            );
        }
        self.persist(&snapshot).await?;
        Ok(snapshot)
    }

    async fn persist(&self, entry: &PlaceholderEntry) -> Result<(), PlaceholderError> {
        self.store.save(entry).await.map_err(PlaceholderError::Store)
    }

    async fn notify_driver(&self, entry: &PlaceholderEntry) {
        if let Err(e) = self.driver.update_placeholder(entry).await {
            warn!(path = %entry.path(), error = %e, "Native placeholder update failed");
        }
    }
}

impl std::fmt::Debug for PlaceholderStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaceholderStateMachine")
            .field("root", &self.root)
            .field("entries", &self.entries.len())
            .field("inflight", &self.inflight.len())
            .finish_non_exhaustive()
    }
}

async fn join(mut rx: watch::Receiver<Option<HydrationOutcome>>) -> HydrationOutcome {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return outcome;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone().unwrap_or(HydrationOutcome::Aborted);
        }
    }
}

async fn report(driver: &Arc<dyn NativeDriver>, path: &SyncPath, fraction: f64) {
    if let Err(e) = driver.report_progress(path, fraction).await {
        debug!(path = %path, error = %e, "Progress report dropped");
    }
}

async fn truncate(path: &SyncPath) -> std::io::Result<()> {
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path.as_path())
        .await?;
    file.set_len(0).await?;
    file.sync_all().await
}

async fn discard_partial(path: &SyncPath) {
    let partial = partial_path(path.as_path());
    match tokio::fs::remove_file(&partial).await {
        Ok(()) => debug!(path = %partial.display(), "Removed leftover partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %partial.display(), error = %e, "Could not remove partial download"),
    }
}

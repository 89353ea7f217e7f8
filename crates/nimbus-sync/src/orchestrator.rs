//! Sync orchestrator
//!
//! Decides what every detected change means and applies it through the
//! placeholder state machine and the remote store.
//!
//! ## Architecture
//!
//! ```text
//!  WatchStream ──► submit_local_event ──┐
//!  RemoteScanner ► submit_remote_event ─┼──► OperationQueue ──► worker pool (N)
//!  driver bridge ► forward_operations ──┘    (one op per path)     │
//!                                                                  ▼
//!                                          execute ──► PlaceholderStateMachine
//!                                             │        RemoteStorage / pipeline
//!                                             ▼
//!                                  classify ──► retry_later (backoff)
//!                                             └► OperationReport (broadcast)
//! ```
//!
//! ## Failure handling
//!
//! Every failure is classified once. ABORTED is absorbed, NETWORK and
//! UNKNOWN are retried with exponential backoff until the attempt limit,
//! after which the entry carries an exhausted error marker. Domain errors
//! (access denied, kind conflict, pinned, busy) fail the operation at once.
//!
//! ## Conflicts
//!
//! A conflict exists when the local file and the remote item both moved
//! past the state recorded at the last sync. Equal hashes converge; else
//! the later modification wins (the remote on a tie) and the losing copy is
//! kept under a conflict name and synced as a new file.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use nimbus_conflict::{
    Conflict, ConflictDetector, ConflictNamer, ConflictResolver, Detection, Resolution, Version,
};
use nimbus_core::{
    classify::{ClassifiedError, Disposition, NetworkFailure, OpContext},
    config::Config,
    domain::{
        ContentHash, DomainError, EntryKind, EntryState, OperationKind, RemoteId, RemoteItem,
        Source, Status, SyncOperation, SyncPath,
    },
    ports::RemoteStorage,
};
use nimbus_placeholder::{HydrationOutcome, PlaceholderError, PlaceholderStateMachine, Registration};
use nimbus_transfer::Fingerprint;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    backoff::Backoff,
    local,
    queue::OperationQueue,
    scanner::RemoteEvent,
    watcher::{WatchEvent, WatchStream},
    SyncError, WatcherError,
};

/// Capacity of the operation report channel
const REPORT_CAPACITY: usize = 256;

// ============================================================================
// Settings and reports
// ============================================================================

/// Tunables of the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Size of the worker pool
    pub workers: usize,
    pub backoff: Backoff,
    pub namer: ConflictNamer,
    /// Deadline of each direct remote call (list, delete, move, mkdir)
    pub call_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.orchestrator.workers.max(1),
            backoff: Backoff::from_config(&config.retry),
            namer: ConflictNamer::from_config(&config.conflicts),
            call_timeout: config.transfer.request_timeout(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// How a finished operation ended
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome {
    Succeeded,
    /// Cancelled or skipped; treated as a no-op success
    Absorbed,
    /// Surfaced at once (`exhausted == false`) or after the last retry
    Failed {
        error: ClassifiedError,
        exhausted: bool,
    },
}

impl OperationOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, OperationOutcome::Failed { .. })
    }
}

/// Published once per finished operation
#[derive(Debug, Clone)]
pub struct OperationReport {
    pub operation: SyncOperation,
    pub outcome: OperationOutcome,
    /// Attempts made, the first one included
    pub attempts: u32,
}

/// What a handler did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Done,
    Absorbed,
}

// ============================================================================
// SyncOrchestrator
// ============================================================================

/// Sole authority over what a detected change means
pub struct SyncOrchestrator {
    machine: Arc<PlaceholderStateMachine>,
    remote: Arc<dyn RemoteStorage>,
    queue: Arc<OperationQueue>,
    resolver: ConflictResolver,
    settings: OrchestratorSettings,
    reports: broadcast::Sender<OperationReport>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator over `machine` and the remote behind its
    /// transfer pipeline
    pub fn new(machine: Arc<PlaceholderStateMachine>, settings: OrchestratorSettings) -> Self {
        let remote = Arc::clone(machine.pipeline().remote());
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        Self {
            machine,
            remote,
            queue: Arc::new(OperationQueue::new()),
            resolver: ConflictResolver::new(settings.namer.clone()),
            settings,
            reports,
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn machine(&self) -> &Arc<PlaceholderStateMachine> {
        &self.machine
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Receives one [`OperationReport`] per finished operation
    pub fn subscribe(&self) -> broadcast::Receiver<OperationReport> {
        self.reports.subscribe()
    }

    // ========================================================================
    // Submission
    // ========================================================================

    pub async fn submit(&self, op: SyncOperation) -> Result<(), SyncError> {
        trace!(op = %op, "Operation submitted");
        self.queue.push(op).await
    }

    pub async fn submit_local_event(&self, event: WatchEvent) -> Result<(), SyncError> {
        self.submit(SyncOperation::new(
            event.kind.into(),
            event.path,
            Source::LocalWatcher,
        ))
        .await
    }

    pub async fn submit_remote_event(&self, event: RemoteEvent) -> Result<(), SyncError> {
        self.submit(event.into_operation()).await
    }

    /// Queues an explicit user request (hydrate, pin, dehydrate, ...)
    pub async fn submit_user_action(
        &self,
        kind: OperationKind,
        path: SyncPath,
    ) -> Result<(), SyncError> {
        self.submit(SyncOperation::new(kind, path, Source::UserAction))
            .await
    }

    /// Feeds watcher events into the queue until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns the watcher's fatal error; the caller must stop syncing.
    pub async fn run_watcher(
        &self,
        mut stream: WatchStream,
        shutdown: CancellationToken,
    ) -> Result<(), WatcherError> {
        info!("Watcher intake started");
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(event)) => {
                    if let Err(e) = self.submit_local_event(event).await {
                        warn!(error = %e, "Operation queue refused local change, stopping intake");
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!(error = %e, "File watcher failed, sync must stop");
                    stream.stop();
                    return Err(e);
                }
                None => break,
            }
        }
        stream.stop();
        info!("Watcher intake stopped");
        Ok(())
    }

    /// Queues operations produced by the native driver bridge
    pub async fn forward_operations(
        &self,
        mut operations: mpsc::Receiver<SyncOperation>,
        shutdown: CancellationToken,
    ) {
        loop {
            let op = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                op = operations.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
            };
            if let Err(e) = self.submit(op).await {
                warn!(error = %e, "Operation queue refused driver operation");
                break;
            }
        }
        debug!("Driver operation intake stopped");
    }

    // ========================================================================
    // Worker pool
    // ========================================================================

    /// Spawns the worker pool
    pub async fn start(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for index in 0..self.settings.workers {
            let orchestrator = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                orchestrator.run_worker(index).await;
            }));
        }
        info!(workers = self.settings.workers, "Sync orchestrator started");
    }

    /// Stops the workers, cancelling running transfers
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.queue.close().await;

        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker ended abnormally");
            }
        }
        info!("Sync orchestrator stopped");
    }

    /// Resolves once no operation is queued, running or waiting to retry
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    async fn run_worker(self: Arc<Self>, index: usize) {
        debug!(worker = index, "Worker started");
        loop {
            let op = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                op = self.queue.next() => match op {
                    Some(op) => op,
                    None => break,
                },
            };
            self.process(op).await;
        }
        debug!(worker = index, "Worker stopped");
    }

    /// Runs one attempt of `op` and settles its fate
    async fn process(&self, mut op: SyncOperation) {
        let ctx = OpContext::new(op.kind.name())
            .with_operation_id(op.id)
            .with_path(&op.path)
            .with_attempt(op.retry_count);
        let attempts = op.retry_count + 1;
        let path = op.path.clone();

        let outcome = match self.execute(&op, &ctx).await {
            Ok(Applied::Done) => OperationOutcome::Succeeded,
            Ok(Applied::Absorbed) => OperationOutcome::Absorbed,
            Err(err) => {
                let classified = err.into_classified(self.machine.reporter(), &ctx);
                match classified.disposition() {
                    Disposition::Absorb => OperationOutcome::Absorbed,
                    Disposition::Retry
                        if self.settings.backoff.should_retry(attempts)
                            && !self.shutdown.is_cancelled() =>
                    {
                        op.retry_count = attempts;
                        let delay = self.settings.backoff.delay(attempts);
                        self.queue.retry_later(op, delay);
                        return;
                    }
                    Disposition::Retry => {
                        error!(op = %op, attempts, kind = %classified.kind, "Retries exhausted, giving up");
                        self.mark_exhausted(&path, &classified).await;
                        OperationOutcome::Failed {
                            error: classified,
                            exhausted: true,
                        }
                    }
                    Disposition::Surface => OperationOutcome::Failed {
                        error: classified,
                        exhausted: false,
                    },
                }
            }
        };

        op.status = match &outcome {
            OperationOutcome::Failed { error, .. } => Status::Failed(error.kind),
            _ => Status::Succeeded,
        };
        self.queue.complete(&path).await;

        debug!(op = %op, attempts, "Operation finished");
        // no subscribers is fine
        let _ = self.reports.send(OperationReport {
            operation: op,
            outcome,
            attempts,
        });
    }

    async fn mark_exhausted(&self, path: &SyncPath, error: &ClassifiedError) {
        if self.machine.get_state(path).is_none() {
            return;
        }
        if let Err(e) = self.machine.record_failure(path, error, true).await {
            warn!(path = %path, error = %e, "Could not record exhausted failure");
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    #[instrument(
        skip(self, op, ctx),
        fields(op_id = %op.id, kind = %op.kind, path = %op.path, source = %op.source, attempt = op.retry_count)
    )]
    async fn execute(&self, op: &SyncOperation, ctx: &OpContext) -> Result<Applied, SyncError> {
        use OperationKind::*;

        match (op.kind, op.source) {
            (Hydrate, _) => self.hydrate(op, ctx).await,
            (Dehydrate, _) => {
                let freed = self.machine.dehydrate(&op.path).await?;
                debug!(freed_bytes = freed, "Dehydrate request applied");
                Ok(Applied::Done)
            }
            (Pin, _) => self.pin(&op.path, ctx).await,
            (Unpin, _) => {
                self.machine.unpin(&op.path).await?;
                Ok(Applied::Done)
            }
            (Move, _) => self.apply_move(op).await,
            (Add | Change, Source::RemoteFeed) => self.apply_remote_file(op, ctx).await,
            (AddDir, Source::RemoteFeed) => self.apply_remote_dir(op).await,
            (Unlink | UnlinkDir, Source::RemoteFeed) => self.apply_remote_delete(&op.path).await,
            (Add | Change, _) => self.upload_local(&op.path, ctx).await,
            (AddDir, _) => {
                self.ensure_remote_dir(&op.path).await?;
                Ok(Applied::Done)
            }
            (Unlink | UnlinkDir, _) => self.delete_remote(op).await,
        }
    }

    // ========================================================================
    // Local changes
    // ========================================================================

    /// Uploads the file at `path` unless the remote moved on meanwhile
    async fn upload_local(&self, path: &SyncPath, ctx: &OpContext) -> Result<Applied, SyncError> {
        let Some(stat) = local::stat(path.as_path()).await? else {
            debug!("File vanished before upload");
            return Ok(Applied::Done);
        };
        if stat.is_dir {
            self.ensure_remote_dir(path).await?;
            return Ok(Applied::Done);
        }

        let entry = self.machine.get_state(path);
        if let Some(entry) = &entry {
            if entry.is_directory() {
                return Err(kind_conflict(path, EntryKind::Directory, EntryKind::File));
            }
            if entry.state().is_transient() {
                return Err(DomainError::Busy(path.to_string()).into());
            }
            if !entry.state().is_local() && stat.size == 0 {
                debug!(state = %entry.state(), "Placeholder stub, nothing to upload");
                return Ok(Applied::Done);
            }
        }

        let hash = local::hash_file(path.as_path()).await?;
        let modified = stat.modified.unwrap_or_else(Utc::now);
        if let Some(entry) = &entry {
            if entry.state().is_local() && entry.content_hash() == Some(&hash) {
                debug!("Content unchanged since last sync");
                return Ok(Applied::Done);
            }
        }

        let parent_id = self.ensure_remote_parent(path).await?;
        let name = file_name(path)?;
        let current = self
            .call("list", self.remote.list(parent_id.as_ref()))
            .await?
            .into_iter()
            .find(|item| item.name == name);

        if let Some(remote_item) = current {
            if remote_item.is_directory() {
                return Err(kind_conflict(path, EntryKind::Directory, EntryKind::File));
            }
            if remote_item.content_hash.as_ref() == Some(&hash) {
                debug!("Remote already holds this content");
                self.machine
                    .record_upload(path, &remote_item, hash, modified)
                    .await?;
                return Ok(Applied::Done);
            }
            if let Some(remote) = Version::from_remote(&remote_item) {
                let local = Version::new(hash.clone(), modified);
                let detection = match &entry {
                    Some(entry) => ConflictDetector::check_remote_change(entry, Some(&local), &remote),
                    None => Detection::Conflicted(Conflict {
                        path: path.clone(),
                        local,
                        remote,
                    }),
                };
                if let Detection::Conflicted(conflict) = detection {
                    return self.resolve_conflict(conflict, &remote_item, ctx).await;
                }
            }
        }

        self.upload(path, parent_id.as_ref(), modified).await?;
        Ok(Applied::Done)
    }

    async fn upload(
        &self,
        path: &SyncPath,
        parent_id: Option<&RemoteId>,
        modified: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let cancel = self.shutdown.child_token();
        let receipt = self
            .machine
            .pipeline()
            .upload(path.as_path(), parent_id, &cancel, &|fraction| {
                trace!(fraction, "Upload progress");
            })
            .await
            .map_err(SyncError::Remote)?;

        self.machine
            .record_upload(path, &receipt.item, receipt.content_hash, modified)
            .await?;
        info!(remote_id = %receipt.item.id, size = receipt.size, chunks = receipt.chunks, "Local change uploaded");
        Ok(())
    }

    /// Removes the remote counterpart of a locally deleted path
    async fn delete_remote(&self, op: &SyncOperation) -> Result<Applied, SyncError> {
        let path = &op.path;
        let Some(entry) = self.machine.get_state(path) else {
            debug!("Untracked path removed, nothing to do");
            return Ok(Applied::Done);
        };
        if op.source == Source::LocalWatcher && local::stat(path.as_path()).await?.is_some() {
            debug!("Path exists again, ignoring stale removal");
            return Ok(Applied::Done);
        }

        if let Some(id) = entry.remote_id() {
            self.call("delete", self.remote.delete(id)).await?;
            info!(remote_id = %id, "Remote item deleted");
        }
        self.machine.forget(path).await?;
        Ok(Applied::Done)
    }

    /// Mirrors a rename the native layer already applied to metadata
    async fn apply_move(&self, op: &SyncOperation) -> Result<Applied, SyncError> {
        let path = &op.path;
        let Some(entry) = self.machine.get_state(path) else {
            debug!("Moved entry is gone, nothing to do");
            return Ok(Applied::Done);
        };

        let Some(id) = entry.remote_id().cloned() else {
            // never synced: upload it under its new name
            let kind = if entry.is_directory() {
                OperationKind::AddDir
            } else {
                OperationKind::Add
            };
            self.submit(SyncOperation::new(kind, path.clone(), Source::LocalWatcher))
                .await?;
            return Ok(Applied::Done);
        };

        let parent_id = self.ensure_remote_parent(path).await?;
        let name = file_name(path)?;
        let item = self
            .call("move_item", self.remote.move_item(&id, parent_id.as_ref(), name))
            .await?;
        self.machine
            .register_placeholder(path, Registration::from_remote(&item))
            .await?;
        info!(from = ?op.origin.as_ref().map(ToString::to_string), remote_id = %item.id, "Remote item moved");
        Ok(Applied::Done)
    }

    /// Returns the remote id of the folder holding `path`, creating
    /// missing folders; `None` for the remote root
    async fn ensure_remote_parent(&self, path: &SyncPath) -> Result<Option<RemoteId>, SyncError> {
        match path.parent() {
            Some(parent) if parent.is_descendant_of(self.machine.root()) => {
                self.ensure_remote_dir(&parent).await
            }
            _ => Ok(None),
        }
    }

    /// Creates the remote folders for `dir` and its missing ancestors
    async fn ensure_remote_dir(&self, dir: &SyncPath) -> Result<Option<RemoteId>, SyncError> {
        let root = self.machine.root();
        let mut missing = Vec::new();
        let mut parent_id = None;
        let mut current = Some(dir.clone());

        while let Some(path) = current {
            if !path.is_descendant_of(root) {
                break;
            }
            match self.machine.get_state(&path) {
                Some(entry) if !entry.is_directory() => {
                    return Err(kind_conflict(&path, EntryKind::File, EntryKind::Directory));
                }
                Some(entry) if entry.remote_id().is_some() => {
                    parent_id = entry.remote_id().cloned();
                    break;
                }
                _ => {
                    current = path.parent();
                    missing.push(path);
                }
            }
        }

        for path in missing.into_iter().rev() {
            let name = file_name(&path)?;
            let item = self
                .call("create_folder", self.remote.create_folder(parent_id.as_ref(), name))
                .await?;
            self.machine
                .record_upload(&path, &item, ContentHash::empty(), Utc::now())
                .await?;
            debug!(path = %path, remote_id = %item.id, "Remote folder ready");
            parent_id = Some(item.id);
        }
        Ok(parent_id)
    }

    // ========================================================================
    // Remote changes
    // ========================================================================

    async fn apply_remote_file(
        &self,
        op: &SyncOperation,
        ctx: &OpContext,
    ) -> Result<Applied, SyncError> {
        let path = &op.path;
        let item = remote_item(op)?;
        if item.is_directory() {
            return self.apply_remote_dir(op).await;
        }

        let Some(entry) = self.machine.get_state(path) else {
            return self.apply_remote_untracked(path, item, ctx).await;
        };
        if entry.is_directory() {
            return Err(kind_conflict(path, EntryKind::Directory, EntryKind::File));
        }

        let same_hash = item.content_hash.is_none() || item.content_hash.as_ref() == entry.content_hash();
        if entry.remote_modified() == Some(item.modified) && same_hash {
            debug!("Remote change already applied");
            return Ok(Applied::Done);
        }

        if entry.state() == EntryState::Hydrated {
            if let (Some(local), Some(remote)) =
                (self.local_version(path).await?, Version::from_remote(item))
            {
                if let Detection::Conflicted(conflict) =
                    ConflictDetector::check_remote_change(&entry, Some(&local), &remote)
                {
                    return self.resolve_conflict(conflict, item, ctx).await;
                }
            }
        }

        let wants_content = match entry.state() {
            EntryState::Hydrated => true,
            EntryState::Error => !entry.has_exhausted_error(),
            _ => entry.is_pinned(),
        };
        if wants_content {
            let outcome = self
                .machine
                .apply_remote_content(path, item, ctx.clone())
                .await?;
            return settle_hydration(outcome);
        }

        self.machine
            .register_placeholder(path, Registration::from_remote(item))
            .await?;
        Ok(Applied::Done)
    }

    /// A remote file appeared at a path the machine does not track
    async fn apply_remote_untracked(
        &self,
        path: &SyncPath,
        item: &RemoteItem,
        ctx: &OpContext,
    ) -> Result<Applied, SyncError> {
        match local::stat(path.as_path()).await? {
            Some(stat) if stat.is_dir => {
                Err(kind_conflict(path, EntryKind::Directory, EntryKind::File))
            }
            Some(stat) => {
                let hash = local::hash_file(path.as_path()).await?;
                let modified = stat.modified.unwrap_or_else(Utc::now);
                if item.content_hash.as_ref() == Some(&hash) {
                    debug!("Local file already matches the remote item");
                    self.machine.record_upload(path, item, hash, modified).await?;
                    return Ok(Applied::Done);
                }
                match Version::from_remote(item) {
                    Some(remote) => {
                        let conflict = Conflict {
                            path: path.clone(),
                            local: Version::new(hash, modified),
                            remote,
                        };
                        self.resolve_conflict(conflict, item, ctx).await
                    }
                    None => {
                        // without a remote hash the local copy is kept and uploaded
                        self.submit(SyncOperation::new(
                            OperationKind::Add,
                            path.clone(),
                            Source::LocalWatcher,
                        ))
                        .await?;
                        Ok(Applied::Done)
                    }
                }
            }
            None => {
                self.machine
                    .register_placeholder(path, Registration::from_remote(item))
                    .await?;
                Ok(Applied::Done)
            }
        }
    }

    async fn apply_remote_dir(&self, op: &SyncOperation) -> Result<Applied, SyncError> {
        let item = remote_item(op)?;
        self.machine
            .register_placeholder(&op.path, Registration::from_remote(item))
            .await?;
        Ok(Applied::Done)
    }

    /// Applies a remote deletion, keeping local edits that were never
    /// uploaded
    async fn apply_remote_delete(&self, path: &SyncPath) -> Result<Applied, SyncError> {
        let Some(entry) = self.machine.get_state(path) else {
            debug!("Remote deletion of an untracked path");
            return Ok(Applied::Done);
        };

        if !entry.is_directory() && entry.state() == EntryState::Hydrated {
            if let Some(local) = self.local_version(path).await? {
                if ConflictDetector::local_changed(&entry, &local) {
                    info!("Remote deleted a locally modified file, keeping the local copy");
                    self.machine.forget(path).await?;
                    self.submit(SyncOperation::new(
                        OperationKind::Add,
                        path.clone(),
                        Source::LocalWatcher,
                    ))
                    .await?;
                    return Ok(Applied::Done);
                }
            }
        }

        let removed = self.machine.delete_local(path).await?;
        info!(entries = removed, "Remote deletion applied");
        Ok(Applied::Done)
    }

    // ========================================================================
    // User actions
    // ========================================================================

    async fn hydrate(&self, op: &SyncOperation, ctx: &OpContext) -> Result<Applied, SyncError> {
        let path = &op.path;
        let Some(entry) = self.machine.get_state(path) else {
            debug!("Hydration requested for an untracked path");
            return Ok(Applied::Absorbed);
        };
        if entry.has_exhausted_error() && op.source != Source::UserAction {
            debug!("Retries exhausted, waiting for an explicit user request");
            return Ok(Applied::Absorbed);
        }

        let outcome = self.machine.hydrate(path, ctx.clone()).await?;
        settle_hydration(outcome)
    }

    async fn pin(&self, path: &SyncPath, ctx: &OpContext) -> Result<Applied, SyncError> {
        let entry = self.machine.pin(path).await?;
        if entry.is_directory() || entry.state() == EntryState::Hydrated {
            return Ok(Applied::Done);
        }
        let outcome = self.machine.hydrate(path, ctx.clone()).await?;
        settle_hydration(outcome)
    }

    // ========================================================================
    // Conflict resolution
    // ========================================================================

    #[instrument(skip(self, conflict, item, ctx), fields(path = %conflict.path))]
    async fn resolve_conflict(
        &self,
        conflict: Conflict,
        item: &RemoteItem,
        ctx: &OpContext,
    ) -> Result<Applied, SyncError> {
        let machine = &self.machine;
        let plan = self.resolver.plan(&conflict, |candidate| {
            machine.get_state(candidate).is_some() || candidate.as_path().exists()
        })?;
        let path = &conflict.path;

        let conflict_path = match (plan.resolution, plan.conflict_path) {
            (Resolution::Converged, _) => {
                machine
                    .record_upload(path, item, conflict.local.content_hash, conflict.local.modified)
                    .await?;
                return Ok(Applied::Done);
            }
            (_, Some(conflict_path)) => conflict_path,
            (_, None) => {
                return Err(DomainError::ValidationFailed(format!(
                    "no conflict name available for {path}"
                ))
                .into())
            }
        };

        if plan.resolution == Resolution::RemoteWins {
            // the local copy moves aside, the remote content takes its place
            let writes = machine.write_log();
            writes.record(path.as_path(), Fingerprint::Removed);
            writes.record(
                conflict_path.as_path(),
                Fingerprint::Content(conflict.local.content_hash.clone()),
            );
            tokio::fs::rename(path.as_path(), conflict_path.as_path()).await?;
            info!(kept_as = %conflict_path, "Remote version wins, local copy kept");

            self.submit(SyncOperation::new(
                OperationKind::Add,
                conflict_path,
                Source::LocalWatcher,
            ))
            .await?;

            let outcome = machine
                .apply_remote_content(path, item, ctx.clone())
                .await?;
            return settle_hydration(outcome);
        }

        // the remote copy is fetched aside, the local content is uploaded
        let cancel = self.shutdown.child_token();
        machine
            .pipeline()
            .download(
                &item.id,
                conflict_path.as_path(),
                item.content_hash.as_ref(),
                item.size,
                &cancel,
                &|_| {},
            )
            .await
            .map_err(SyncError::Remote)?;
        info!(kept_as = %conflict_path, "Local version wins, remote copy kept");

        self.upload(path, item.parent_id.as_ref(), conflict.local.modified)
            .await?;
        self.submit(SyncOperation::new(
            OperationKind::Add,
            conflict_path,
            Source::LocalWatcher,
        ))
        .await?;
        Ok(Applied::Done)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Hash and modification time of the file on disk, if there is one
    async fn local_version(&self, path: &SyncPath) -> Result<Option<Version>, SyncError> {
        match local::stat(path.as_path()).await? {
            Some(stat) if !stat.is_dir => {
                let hash = local::hash_file(path.as_path()).await?;
                Ok(Some(Version::new(hash, stat.modified.unwrap_or_else(Utc::now))))
            }
            _ => Ok(None),
        }
    }

    /// Runs a direct remote call under the per-call deadline
    async fn call<T, F>(&self, operation: &'static str, call: F) -> Result<T, SyncError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result.map_err(SyncError::Remote),
            Err(_) => Err(SyncError::Remote(
                NetworkFailure::timeout(operation, self.settings.call_timeout).into(),
            )),
        }
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("root", self.machine.root())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn settle_hydration(outcome: HydrationOutcome) -> Result<Applied, SyncError> {
    match outcome {
        HydrationOutcome::Hydrated | HydrationOutcome::AlreadyHydrated => Ok(Applied::Done),
        HydrationOutcome::Aborted => Ok(Applied::Absorbed),
        HydrationOutcome::Failed(classified) => Err(SyncError::Classified(classified)),
    }
}

fn remote_item(op: &SyncOperation) -> Result<&RemoteItem, SyncError> {
    op.remote.as_ref().ok_or_else(|| {
        DomainError::ValidationFailed(format!("remote operation on {} carries no item", op.path))
            .into()
    })
}

fn file_name(path: &SyncPath) -> Result<&str, SyncError> {
    path.file_name()
        .ok_or_else(|| DomainError::InvalidPath(path.to_string()).into())
}

fn kind_conflict(path: &SyncPath, existing: EntryKind, requested: EntryKind) -> SyncError {
    SyncError::Placeholder(PlaceholderError::Domain(DomainError::KindConflict {
        path: path.to_string(),
        existing: existing.to_string(),
        requested: requested.to_string(),
    }))
}

//! SyncOperation domain entity
//!
//! A `SyncOperation` is one pending unit of work for the orchestrator.
//! It is created from a watcher event, a remote change or a user action
//! and lives until a worker finishes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::newtypes::{OperationId, SyncPath};
use super::remote_item::RemoteItem;
use crate::classify::ErrorKind;

/// What the operation does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// File appeared
    Add,
    /// File content changed
    Change,
    /// File removed
    Unlink,
    /// Directory appeared
    AddDir,
    /// Directory removed
    UnlinkDir,
    /// Materialize content
    Hydrate,
    /// Drop materialized content
    Dehydrate,
    /// Keep content materialized
    Pin,
    /// Allow automatic dehydration again
    Unpin,
    /// Item renamed or moved; `origin` holds the old path
    Move,
}

impl OperationKind {
    /// Returns the kind name as a string
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Add => "add",
            OperationKind::Change => "change",
            OperationKind::Unlink => "unlink",
            OperationKind::AddDir => "add_dir",
            OperationKind::UnlinkDir => "unlink_dir",
            OperationKind::Hydrate => "hydrate",
            OperationKind::Dehydrate => "dehydrate",
            OperationKind::Pin => "pin",
            OperationKind::Unpin => "unpin",
            OperationKind::Move => "move",
        }
    }

    /// Returns true for kinds that carry file or directory content changes
    pub fn is_content_change(&self) -> bool {
        matches!(
            self,
            OperationKind::Add
                | OperationKind::Change
                | OperationKind::Unlink
                | OperationKind::AddDir
                | OperationKind::UnlinkDir
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the operation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Local filesystem watcher
    LocalWatcher,
    /// Remote change feed
    RemoteFeed,
    /// Explicit user request (including native driver callbacks)
    UserAction,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::LocalWatcher => "local_watcher",
            Source::RemoteFeed => "remote_feed",
            Source::UserAction => "user_action",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a queued operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting in the queue
    Queued,
    /// Picked up by a worker
    InProgress,
    /// Finished without error
    Succeeded,
    /// Finished with a surfaced or exhausted failure
    Failed(ErrorKind),
}

impl Status {
    /// Returns true once the operation has finished
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Succeeded | Status::Failed(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Queued => write!(f, "queued"),
            Status::InProgress => write!(f, "in_progress"),
            Status::Succeeded => write!(f, "succeeded"),
            Status::Failed(kind) => write!(f, "failed({kind})"),
        }
    }
}

/// One unit of pending work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Unique identifier
    pub id: OperationId,
    /// What to do
    pub kind: OperationKind,
    /// Path the operation acts on
    pub path: SyncPath,
    /// Origin of the request
    pub source: Source,
    /// When the underlying change was detected
    pub detected_at: DateTime<Utc>,
    /// Lifecycle status
    pub status: Status,
    /// Number of retries performed so far
    pub retry_count: u32,
    /// Remote metadata for operations from the remote feed
    pub remote: Option<RemoteItem>,
    /// Previous path for [`OperationKind::Move`]
    pub origin: Option<SyncPath>,
}

impl SyncOperation {
    /// Creates a new queued operation
    pub fn new(kind: OperationKind, path: SyncPath, source: Source) -> Self {
        Self {
            id: OperationId::new(),
            kind,
            path,
            source,
            detected_at: Utc::now(),
            status: Status::Queued,
            retry_count: 0,
            remote: None,
            origin: None,
        }
    }

    /// Creates an operation carrying remote metadata
    pub fn from_remote(kind: OperationKind, path: SyncPath, item: RemoteItem) -> Self {
        let mut op = Self::new(kind, path, Source::RemoteFeed);
        op.remote = Some(item);
        op
    }

    /// Creates a move from `origin` to `path`
    pub fn moved(origin: SyncPath, path: SyncPath, source: Source) -> Self {
        let mut op = Self::new(OperationKind::Move, path, source);
        op.origin = Some(origin);
        op
    }

    /// Overrides the detection timestamp
    pub fn detected_at(mut self, at: DateTime<Utc>) -> Self {
        self.detected_at = at;
        self
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({}, {})", self.kind, self.path, self.source, self.status)
    }
}

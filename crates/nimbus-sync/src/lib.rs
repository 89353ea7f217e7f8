//! Nimbus Sync - Local and remote change propagation
//!
//! Provides:
//! - A debounced recursive file watcher with echo suppression
//! - A per-path serialized operation queue with coalescing
//! - The sync orchestrator: a worker pool applying operations with
//!   classified retries and conflict resolution
//! - A remote scanner that turns listing differences into operations
//!
//! ## Modules
//!
//! - [`watcher`] - OS notifications to debounced [`WatchEvent`]s
//! - [`queue`] - Per-path FIFO shared by the workers
//! - [`backoff`] - Exponential retry delays
//! - [`orchestrator`] - Operation handlers and the worker pool
//! - [`scanner`] - Remote listing diff
//! - [`local`] - Stat and hash helpers

pub mod backoff;
pub mod local;
pub mod orchestrator;
pub mod queue;
pub mod scanner;
pub mod watcher;

pub use backoff::Backoff;
pub use orchestrator::{
    OperationOutcome, OperationReport, OrchestratorSettings, SyncOrchestrator,
};
pub use queue::OperationQueue;
pub use scanner::{RemoteEvent, RemoteScanner};
pub use watcher::{FileWatcher, WatchEvent, WatchEventKind, WatchStopHandle, WatchStream};

use std::path::{Path, PathBuf};

use nimbus_conflict::ConflictError;
use nimbus_core::{
    classify::{ClassifiedError, ErrorReporter, OpContext},
    domain::DomainError,
};
use nimbus_placeholder::PlaceholderError;
use thiserror::Error;

/// Errors raised while applying a sync operation
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Placeholder error: {0}")]
    Placeholder(#[from] PlaceholderError),

    #[error("Conflict error: {0}")]
    Conflict(#[from] ConflictError),

    #[error("Remote error: {0:#}")]
    Remote(anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Already classified and logged by the component that failed
    #[error(transparent)]
    Classified(ClassifiedError),

    #[error("Operation queue closed")]
    QueueClosed,
}

impl SyncError {
    /// Classifies the error and logs it once
    ///
    /// Errors that were classified further down are returned as they are,
    /// without a second log line.
    pub fn into_classified(self, reporter: &ErrorReporter, ctx: &OpContext) -> ClassifiedError {
        let error = match self {
            SyncError::Classified(classified) => return classified,
            SyncError::Placeholder(PlaceholderError::Domain(e)) | SyncError::Domain(e) => {
                anyhow::Error::new(e)
            }
            SyncError::Placeholder(PlaceholderError::Driver(e))
            | SyncError::Placeholder(PlaceholderError::Store(e))
            | SyncError::Remote(e) => e,
            SyncError::Placeholder(PlaceholderError::Io(e)) | SyncError::Io(e) => {
                anyhow::Error::new(e)
            }
            other => anyhow::Error::new(other),
        };
        reporter.report(ctx, &error)
    }
}

/// Fatal failures of the file watcher
///
/// The watch stream ends after yielding one of these; syncing must stop.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Sync root does not exist: {0}")]
    RootMissing(PathBuf),

    #[error("Permission denied watching {0}")]
    PermissionDenied(PathBuf),

    #[error("OS watch limit reached while watching {0}")]
    WatchLimit(PathBuf),

    #[error("File watcher failure: {0}")]
    Backend(String),

    #[error("File watcher stopped unexpectedly")]
    Closed,
}

impl WatcherError {
    pub(crate) fn from_notify(root: &Path, err: notify::Error) -> Self {
        match err.kind {
            notify::ErrorKind::PathNotFound => WatcherError::RootMissing(root.to_path_buf()),
            notify::ErrorKind::MaxFilesWatch => WatcherError::WatchLimit(root.to_path_buf()),
            notify::ErrorKind::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
                WatcherError::RootMissing(root.to_path_buf())
            }
            notify::ErrorKind::Io(ref io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
                WatcherError::PermissionDenied(root.to_path_buf())
            }
            _ => WatcherError::Backend(err.to_string()),
        }
    }
}

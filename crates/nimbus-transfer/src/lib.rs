//! Nimbus Transfer - Chunked upload/download pipeline
//!
//! Provides:
//! - A global transfer limiter (in-flight cap plus start spacing)
//! - Chunked uploads and temp-file-then-rename downloads with hash verification
//! - The short-lived write log the watcher consults for echo suppression
//! - Remote storage adapters: an HTTP client and an in-memory store
//!
//! ## Modules
//!
//! - [`limiter`] - Global limiter shared by every transfer
//! - [`echo`] - Record of the engine's own writes
//! - [`pipeline`] - Upload and download streams
//! - [`http`] - `RemoteStorage` over a JSON/REST API
//! - [`memory`] - `RemoteStorage` held in memory, with fault injection

pub mod echo;
pub mod http;
pub mod limiter;
pub mod memory;
pub mod pipeline;

pub use echo::{Fingerprint, WriteLog};
pub use http::HttpRemoteStorage;
pub use limiter::{TransferLimiter, TransferPermit};
pub use memory::{Fault, MemoryRemote, RemoteCall};
pub use pipeline::{is_partial_path, partial_path, DownloadReceipt, TransferPipeline, UploadReceipt};

use nimbus_core::domain::ContentHash;
use thiserror::Error;

/// Errors raised by the transfer pipeline and its adapters
///
/// These travel inside `anyhow::Error` chains next to the classifier's
/// marker errors; on their own they classify as UNKNOWN.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Downloaded or uploaded bytes do not hash to the expected value
    #[error("Content hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Affected path or remote id
        path: String,
        /// Hash the remote declared
        expected: ContentHash,
        /// Hash of the bytes actually transferred
        actual: ContentHash,
    },

    /// The last chunk was sent but the remote never confirmed the item
    #[error("Upload of {0} finished without a completed remote item")]
    IncompleteUpload(String),

    /// The source file shrank or grew while it was being read
    #[error("Source changed during upload: {0}")]
    SourceChanged(String),

    /// The remote answered with an unexpected HTTP status
    #[error("{operation} failed with HTTP {status}: {message}")]
    Status {
        /// Operation name
        operation: String,
        /// HTTP status code
        status: u16,
        /// Truncated response body
        message: String,
    },

    /// The limiter's semaphore was closed
    #[error("Transfer limiter closed")]
    LimiterClosed,

    /// A local path could not be used for a transfer
    #[error("Invalid transfer path: {0}")]
    InvalidPath(String),
}

//! Chunked transfer pipeline
//!
//! ## Uploads
//!
//! The local file is read in fixed-size chunks (5 MiB by default). Each
//! chunk is hashed, sent through the remote upload session, and followed
//! by a progress report. The remote item returned with the last chunk is
//! checked against the local size and hash.
//!
//! ## Downloads
//!
//! ```text
//!  remote stream ──► <dest>.nimbus-partial ──(hash ok)──► rename ──► <dest>
//!                           │
//!                           └──(cancel / error / bad hash)──► removed
//! ```
//!
//! Bytes never land at the destination until the whole stream has been
//! received and verified, so a failed or cancelled download leaves the
//! destination exactly as it was.
//!
//! Every transfer holds a [`TransferPermit`](crate::limiter::TransferPermit)
//! for its whole duration, checks its cancellation token at each chunk
//! boundary, and puts a deadline on every individual network call.

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use futures_util::StreamExt;
use nimbus_core::{
    classify::{Cancelled, NetworkFailure},
    config::TransferConfig,
    domain::{ContentHash, RemoteId, RemoteItem},
    ports::{ChunkOutcome, RemoteStorage},
};
use sha2::{Digest, Sha256};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    echo::{Fingerprint, WriteLog},
    limiter::TransferLimiter,
    TransferError,
};

/// Suffix of the temporary sibling a download streams into
pub const PARTIAL_SUFFIX: &str = ".nimbus-partial";

/// Returns the temporary path used while downloading to `destination`
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    destination.with_file_name(name)
}

/// Returns true for the pipeline's own temporary files
pub fn is_partial_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(PARTIAL_SUFFIX))
}

/// Result of a completed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Item as reported by the remote
    pub item: RemoteItem,
    /// SHA-256 of the uploaded bytes
    pub content_hash: ContentHash,
    /// Bytes uploaded
    pub size: u64,
    /// Number of chunks sent
    pub chunks: usize,
}

/// Result of a completed download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReceipt {
    /// SHA-256 of the published bytes
    pub content_hash: ContentHash,
    /// Bytes written
    pub size: u64,
}

/// Uploads and downloads file content through a [`RemoteStorage`]
pub struct TransferPipeline {
    remote: Arc<dyn RemoteStorage>,
    limiter: Arc<TransferLimiter>,
    writes: Arc<WriteLog>,
    chunk_size: u64,
    call_timeout: Duration,
}

impl TransferPipeline {
    /// Creates a pipeline from the `transfer` configuration section
    pub fn new(
        remote: Arc<dyn RemoteStorage>,
        limiter: Arc<TransferLimiter>,
        writes: Arc<WriteLog>,
        config: &TransferConfig,
    ) -> Self {
        Self::with_settings(
            remote,
            limiter,
            writes,
            config.chunk_size_bytes,
            config.request_timeout(),
        )
    }

    /// Creates a pipeline with explicit chunk size and per-call deadline
    pub fn with_settings(
        remote: Arc<dyn RemoteStorage>,
        limiter: Arc<TransferLimiter>,
        writes: Arc<WriteLog>,
        chunk_size: u64,
        call_timeout: Duration,
    ) -> Self {
        Self {
            remote,
            limiter,
            writes,
            chunk_size: chunk_size.max(1),
            call_timeout,
        }
    }

    /// Remote store used by this pipeline
    pub fn remote(&self) -> &Arc<dyn RemoteStorage> {
        &self.remote
    }

    /// Write log fed by every published download
    pub fn write_log(&self) -> &Arc<WriteLog> {
        &self.writes
    }

    /// Upload chunk size in bytes
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    // ========================================================================
    // Upload
    // ========================================================================

    /// Uploads the file at `source` into `parent_id`, keeping its file name
    ///
    /// Progress is reported after every chunk; the final report is `1.0`.
    ///
    /// # Errors
    /// - [`Cancelled`] if `cancel` fires at a chunk boundary
    /// - [`NetworkFailure`] if a call exceeds its deadline
    /// - [`TransferError`] if the source changes mid-upload or the remote
    ///   reports a different hash
    pub async fn upload(
        &self,
        source: &Path,
        parent_id: Option<&RemoteId>,
        cancel: &CancellationToken,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> anyhow::Result<UploadReceipt> {
        let name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TransferError::InvalidPath(source.display().to_string()))?;

        let _permit = self.limiter.acquire(cancel).await?;

        let mut file = File::open(source)
            .await
            .with_context(|| format!("Failed to open {} for upload", source.display()))?;
        let total = file.metadata().await?.len();

        let session = self
            .timed("begin_upload", self.remote.begin_upload(parent_id, name, total))
            .await?;
        debug!(path = %source.display(), total, "Upload session opened");

        let mut hasher = Sha256::new();
        let mut offset = 0u64;
        let mut chunks = 0usize;
        let mut completed = None;

        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }

            let want = self.chunk_size.min(total - offset);
            let mut buf = Vec::with_capacity(want as usize);
            (&mut file).take(want).read_to_end(&mut buf).await?;
            if (buf.len() as u64) < want {
                return Err(TransferError::SourceChanged(source.display().to_string()).into());
            }

            hasher.update(&buf);
            let sent = buf.len() as u64;
            let outcome = self
                .timed(
                    "upload_chunk",
                    self.remote.upload_chunk(&session, offset, buf),
                )
                .await?;
            offset += sent;
            chunks += 1;
            progress(fraction(offset, total));

            if let ChunkOutcome::Complete(item) = outcome {
                completed = Some(item);
            }
            if offset >= total {
                break;
            }
        }

        let item =
            completed.ok_or_else(|| TransferError::IncompleteUpload(source.display().to_string()))?;
        let content_hash = ContentHash::from_digest(&hasher.finalize());

        if let Some(remote_hash) = &item.content_hash {
            if remote_hash != &content_hash {
                return Err(TransferError::HashMismatch {
                    path: source.display().to_string(),
                    expected: content_hash,
                    actual: remote_hash.clone(),
                }
                .into());
            }
        }

        info!(
            path = %source.display(),
            remote_id = %item.id,
            size = total,
            chunks,
            "Upload completed"
        );

        Ok(UploadReceipt {
            item,
            content_hash,
            size: total,
            chunks,
        })
    }

    // ========================================================================
    // Download
    // ========================================================================

    /// Downloads `remote_id` to `destination` atomically
    ///
    /// # Arguments
    /// * `remote_id` - Item to fetch
    /// * `destination` - Final path; only touched by the closing rename
    /// * `expected_hash` - Hash the content must match, when known
    /// * `size_hint` - Declared size, used for progress reporting
    /// * `cancel` - Checked between received chunks
    /// * `progress` - Receives fractions in `0.0..=1.0`
    ///
    /// # Errors
    /// Any failure removes the temporary file before returning.
    pub async fn download(
        &self,
        remote_id: &RemoteId,
        destination: &Path,
        expected_hash: Option<&ContentHash>,
        size_hint: u64,
        cancel: &CancellationToken,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> anyhow::Result<DownloadReceipt> {
        let _permit = self.limiter.acquire(cancel).await?;
        let partial = partial_path(destination);

        let result = self
            .download_into(
                remote_id,
                destination,
                &partial,
                expected_hash,
                size_hint,
                cancel,
                progress,
            )
            .await;

        if result.is_err() {
            discard(&partial).await;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_into(
        &self,
        remote_id: &RemoteId,
        destination: &Path,
        partial: &Path,
        expected_hash: Option<&ContentHash>,
        size_hint: u64,
        cancel: &CancellationToken,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> anyhow::Result<DownloadReceipt> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut stream = self
            .timed("download", self.remote.download(remote_id))
            .await?;
        let mut file = File::create(partial)
            .await
            .with_context(|| format!("Failed to create {}", partial.display()))?;

        let mut hasher = Sha256::new();
        let mut received = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled.into());
            }

            let next = self.timed("download_chunk", async { Ok(stream.next().await) }).await?;
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if size_hint > 0 {
                progress(fraction(received, size_hint).min(0.99));
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let content_hash = ContentHash::from_digest(&hasher.finalize());
        if let Some(expected) = expected_hash {
            if expected != &content_hash {
                return Err(TransferError::HashMismatch {
                    path: destination.display().to_string(),
                    expected: expected.clone(),
                    actual: content_hash,
                }
                .into());
            }
        }

        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }

        self.writes
            .record(destination, Fingerprint::Content(content_hash.clone()));
        tokio::fs::rename(partial, destination)
            .await
            .with_context(|| format!("Failed to publish {}", destination.display()))?;
        progress(1.0);

        info!(
            remote_id = %remote_id,
            path = %destination.display(),
            size = received,
            "Download completed"
        );

        Ok(DownloadReceipt {
            content_hash,
            size: received,
        })
    }

    /// Applies the per-call deadline, mapping expiry to a network failure
    pub async fn timed<T>(
        &self,
        operation: &str,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(NetworkFailure::timeout(operation, self.call_timeout).into()),
        }
    }
}

impl std::fmt::Debug for TransferPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferPipeline")
            .field("limiter", &self.limiter)
            .field("chunk_size", &self.chunk_size)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        (done as f64 / total as f64).min(1.0)
    }
}

async fn discard(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => debug!(path = %partial.display(), "Discarded partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            path = %partial.display(),
            error = %e,
            "Failed to remove partial download"
        ),
    }
}

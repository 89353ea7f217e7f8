//! Remote storage port (driven/secondary port)
//!
//! This module defines the interface the transfer pipeline and the
//! orchestrator use to talk to the remote object store: chunked upload
//! sessions, streamed downloads, folder listing, deletion, moves and
//! folder creation.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because errors at port boundaries are
//!   adapter-specific. Adapters put [`crate::classify::NetworkFailure`],
//!   [`crate::classify::MalformedResponse`] or a
//!   [`crate::domain::DomainError`] into the chain so the classifier can
//!   recognise them.
//! - Authentication is applied by the adapter (see [`TokenProvider`]);
//!   callers never see credentials.
//! - Downloads are exposed as a stream of byte chunks so the pipeline can
//!   check for cancellation between chunks.

use std::pin::Pin;

use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::domain::{RemoteId, RemoteItem};

/// Stream of downloaded byte chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = anyhow::Result<Vec<u8>>> + Send>>;

/// An open chunked upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Adapter-specific session locator (e.g. an upload URL)
    pub locator: String,
    /// Total number of bytes that will be sent
    pub total_size: u64,
}

/// Result of sending one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// More chunks are expected
    Pending,
    /// The last chunk was accepted and the item exists remotely
    Complete(RemoteItem),
}

/// Remote object store
///
/// ## Implementation Notes
///
/// - `upload_chunk` is called with strictly increasing, contiguous offsets.
///   The call carrying the final byte returns [`ChunkOutcome::Complete`].
/// - A zero-byte upload consists of exactly one empty chunk at offset 0.
/// - `list(None)` lists the remote root.
#[async_trait::async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Opens an upload session for a file named `name` under `parent_id`
    ///
    /// # Arguments
    /// * `parent_id` - Parent folder, `None` for the remote root
    /// * `name` - File name
    /// * `total_size` - Number of bytes that will be uploaded
    async fn begin_upload(
        &self,
        parent_id: Option<&RemoteId>,
        name: &str,
        total_size: u64,
    ) -> anyhow::Result<UploadSession>;

    /// Sends `bytes` starting at `offset` within the session
    async fn upload_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        bytes: Vec<u8>,
    ) -> anyhow::Result<ChunkOutcome>;

    /// Opens a byte stream over the item's content
    async fn download(&self, id: &RemoteId) -> anyhow::Result<ByteStream>;

    /// Lists the direct children of a folder
    async fn list(&self, folder_id: Option<&RemoteId>) -> anyhow::Result<Vec<RemoteItem>>;

    /// Deletes an item; folders are deleted recursively
    async fn delete(&self, id: &RemoteId) -> anyhow::Result<()>;

    /// Moves and/or renames an item
    ///
    /// # Arguments
    /// * `id` - Item to move
    /// * `new_parent` - Destination folder, `None` for the remote root
    /// * `new_name` - New name
    async fn move_item(
        &self,
        id: &RemoteId,
        new_parent: Option<&RemoteId>,
        new_name: &str,
    ) -> anyhow::Result<RemoteItem>;

    /// Creates a folder, returning the existing one if it is already there
    async fn create_folder(
        &self,
        parent_id: Option<&RemoteId>,
        name: &str,
    ) -> anyhow::Result<RemoteItem>;
}

/// Source of bearer tokens for the remote API
///
/// Token acquisition and refresh live outside this workspace; adapters
/// only ask for the current token before each request.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a currently valid access token
    async fn access_token(&self) -> anyhow::Result<String>;
}

/// A fixed token, for tests and for deployments with long-lived tokens
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait::async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> anyhow::Result<String> {
        Ok(self.0.clone())
    }
}

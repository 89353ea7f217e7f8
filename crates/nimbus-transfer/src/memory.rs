//! In-memory remote storage
//!
//! A complete [`RemoteStorage`] kept in process memory. Used by tests across
//! the workspace and for running the engine without a backend.
//!
//! Besides the port operations it offers:
//! - seeding helpers (`insert_file`, `insert_folder`, `update_content`)
//! - call counters per [`RemoteCall`]
//! - the sizes of every uploaded chunk
//! - one-shot fault injection per call ([`Fault`])
//! - a per-chunk delay on downloads, for cancellation tests

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use nimbus_core::{
    classify::{MalformedResponse, NetworkFailure, ResponseDiagnostics},
    domain::{ContentHash, DomainError, EntryKind, RemoteId, RemoteItem},
    ports::{ByteStream, ChunkOutcome, RemoteStorage, UploadSession},
};
use sha2::{Digest, Sha256};
use tracing::trace;

/// Remote operations, for counters and fault targeting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteCall {
    BeginUpload,
    UploadChunk,
    Download,
    List,
    Delete,
    Move,
    CreateFolder,
}

/// Failure injected into the next matching call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connectivity failure
    Network,
    /// An HTML error page where JSON was expected
    Malformed,
    /// Generic server-side failure
    Unknown,
    /// Credentials rejected
    AccessDenied,
    /// Download only: first chunk is delivered, then the stream fails
    Interrupted,
    /// Download only: bytes are altered in flight
    Corrupted,
    /// The call never completes
    Stalled,
}

#[derive(Debug, Clone)]
struct StoredItem {
    item: RemoteItem,
    content: Vec<u8>,
}

#[derive(Debug)]
struct PendingUpload {
    parent_id: Option<RemoteId>,
    name: String,
    total_size: u64,
    buffer: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    items: HashMap<RemoteId, StoredItem>,
    sessions: HashMap<String, PendingUpload>,
    next_id: u64,
    chunk_sizes: Vec<usize>,
    calls: HashMap<RemoteCall, usize>,
    faults: HashMap<RemoteCall, VecDeque<Fault>>,
    download_chunk: usize,
    download_delay: Option<Duration>,
}

/// In-memory [`RemoteStorage`]
#[derive(Debug)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_of(content: &[u8]) -> ContentHash {
    ContentHash::from_digest(&Sha256::digest(content))
}

impl MemoryRemote {
    /// Creates an empty store
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                download_chunk: 64 * 1024,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Seeding and inspection
    // ------------------------------------------------------------------------

    /// Stores a file, replacing any file of the same name in `parent`
    pub fn insert_file(
        &self,
        parent: Option<&RemoteId>,
        name: &str,
        content: &[u8],
        modified: DateTime<Utc>,
    ) -> Result<RemoteItem> {
        let mut state = self.state();
        store_file(&mut state, parent.cloned(), name, content.to_vec(), modified)
    }

    /// Stores a folder, returning the existing one if present
    pub fn insert_folder(&self, parent: Option<&RemoteId>, name: &str) -> Result<RemoteItem> {
        let mut state = self.state();
        store_folder(&mut state, parent.cloned(), name)
    }

    /// Replaces the content of an existing file
    pub fn update_content(
        &self,
        id: &RemoteId,
        content: &[u8],
        modified: DateTime<Utc>,
    ) -> Option<RemoteItem> {
        let mut state = self.state();
        let stored = state.items.get_mut(id)?;
        stored.content = content.to_vec();
        stored.item.size = content.len() as u64;
        stored.item.content_hash = Some(hash_of(content));
        stored.item.modified = modified;
        Some(stored.item.clone())
    }

    /// Metadata of an item
    pub fn item(&self, id: &RemoteId) -> Option<RemoteItem> {
        self.state().items.get(id).map(|s| s.item.clone())
    }

    /// Content of a file
    pub fn content(&self, id: &RemoteId) -> Option<Vec<u8>> {
        self.state().items.get(id).map(|s| s.content.clone())
    }

    /// Finds a child of `parent` by name
    pub fn find(&self, parent: Option<&RemoteId>, name: &str) -> Option<RemoteItem> {
        self.state()
            .items
            .values()
            .find(|s| s.item.parent_id.as_ref() == parent && s.item.name == name)
            .map(|s| s.item.clone())
    }

    /// Number of stored items
    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    /// Returns true if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.state().items.is_empty()
    }

    /// Sizes of every chunk received by `upload_chunk`, in order
    pub fn chunk_sizes(&self) -> Vec<usize> {
        self.state().chunk_sizes.clone()
    }

    /// How many times `call` was invoked
    pub fn calls(&self, call: RemoteCall) -> usize {
        self.state().calls.get(&call).copied().unwrap_or(0)
    }

    /// Total number of calls of any kind
    pub fn total_calls(&self) -> usize {
        self.state().calls.values().sum()
    }

    // ------------------------------------------------------------------------
    // Behaviour knobs
    // ------------------------------------------------------------------------

    /// Makes the next `call` fail with `fault`; queued faults fire in order
    pub fn fail_next(&self, call: RemoteCall, fault: Fault) {
        self.state().faults.entry(call).or_default().push_back(fault);
    }

    /// Size of the chunks a download stream yields
    pub fn set_download_chunk(&self, bytes: usize) {
        self.state().download_chunk = bytes.max(1);
    }

    /// Delay before each download chunk is yielded
    pub fn set_download_delay(&self, delay: Option<Duration>) {
        self.state().download_delay = delay;
    }

    /// Counts the call and pops a queued fault for it
    fn enter(&self, call: RemoteCall) -> Option<Fault> {
        let mut state = self.state();
        *state.calls.entry(call).or_default() += 1;
        state.faults.get_mut(&call).and_then(VecDeque::pop_front)
    }

    async fn check(&self, call: RemoteCall) -> Result<Option<Fault>> {
        match self.enter(call) {
            Some(fault @ (Fault::Interrupted | Fault::Corrupted)) => Ok(Some(fault)),
            Some(Fault::Stalled) => {
                trace!(?call, "Stalling call");
                std::future::pending::<()>().await;
                Ok(None)
            }
            Some(fault) => Err(fault_error(call, fault)),
            None => Ok(None),
        }
    }
}

fn fault_error(call: RemoteCall, fault: Fault) -> anyhow::Error {
    match fault {
        Fault::Network | Fault::Interrupted => {
            NetworkFailure::new(format!("{call:?}: connection reset by peer")).into()
        }
        Fault::Malformed => MalformedResponse(ResponseDiagnostics::new(
            502,
            "Bad Gateway",
            Some("text/html".to_string()),
            [("content-type", "text/html"), ("server", "memory")],
            "<html><body><h1>502 Bad Gateway</h1></body></html>",
        ))
        .into(),
        Fault::Unknown | Fault::Corrupted | Fault::Stalled => anyhow!("{call:?}: internal server error"),
        Fault::AccessDenied => DomainError::AccessDenied(format!("{call:?}: HTTP 403")).into(),
    }
}

fn allocate_id(state: &mut State) -> Result<RemoteId> {
    state.next_id += 1;
    Ok(RemoteId::new(format!("mem-{}", state.next_id))?)
}

fn store_file(
    state: &mut State,
    parent_id: Option<RemoteId>,
    name: &str,
    content: Vec<u8>,
    modified: DateTime<Utc>,
) -> Result<RemoteItem> {
    let existing = state
        .items
        .values()
        .find(|s| s.item.parent_id == parent_id && s.item.name == name && !s.item.is_directory())
        .map(|s| s.item.id.clone());
    let id = match existing {
        Some(id) => id,
        None => allocate_id(state)?,
    };

    let item = RemoteItem {
        id: id.clone(),
        parent_id,
        name: name.to_string(),
        kind: EntryKind::File,
        size: content.len() as u64,
        content_hash: Some(hash_of(&content)),
        modified,
    };
    state.items.insert(
        id,
        StoredItem {
            item: item.clone(),
            content,
        },
    );
    Ok(item)
}

fn store_folder(state: &mut State, parent_id: Option<RemoteId>, name: &str) -> Result<RemoteItem> {
    if let Some(existing) = state
        .items
        .values()
        .find(|s| s.item.parent_id == parent_id && s.item.name == name && s.item.is_directory())
    {
        return Ok(existing.item.clone());
    }

    let id = allocate_id(state)?;
    let item = RemoteItem {
        id: id.clone(),
        parent_id,
        name: name.to_string(),
        kind: EntryKind::Directory,
        size: 0,
        content_hash: None,
        modified: Utc::now(),
    };
    state.items.insert(
        id,
        StoredItem {
            item: item.clone(),
            content: Vec::new(),
        },
    );
    Ok(item)
}

fn not_found(id: &RemoteId) -> anyhow::Error {
    DomainError::NotFound(format!("remote item {id}")).into()
}

#[async_trait::async_trait]
impl RemoteStorage for MemoryRemote {
    async fn begin_upload(
        &self,
        parent_id: Option<&RemoteId>,
        name: &str,
        total_size: u64,
    ) -> Result<UploadSession> {
        self.check(RemoteCall::BeginUpload).await?;
        let mut state = self.state();
        if let Some(parent) = parent_id {
            if !state.items.contains_key(parent) {
                return Err(not_found(parent));
            }
        }
        state.next_id += 1;
        let locator = format!("session-{}", state.next_id);
        state.sessions.insert(
            locator.clone(),
            PendingUpload {
                parent_id: parent_id.cloned(),
                name: name.to_string(),
                total_size,
                buffer: Vec::new(),
            },
        );
        Ok(UploadSession {
            locator,
            total_size,
        })
    }

    async fn upload_chunk(
        &self,
        session: &UploadSession,
        offset: u64,
        bytes: Vec<u8>,
    ) -> Result<ChunkOutcome> {
        self.check(RemoteCall::UploadChunk).await?;
        let mut state = self.state();
        state.chunk_sizes.push(bytes.len());

        let pending = state
            .sessions
            .get_mut(&session.locator)
            .ok_or_else(|| anyhow!("unknown upload session {}", session.locator))?;
        if offset != pending.buffer.len() as u64 {
            return Err(anyhow!(
                "chunk offset {offset} does not follow {} received bytes",
                pending.buffer.len()
            ));
        }
        pending.buffer.extend_from_slice(&bytes);
        if (pending.buffer.len() as u64) < pending.total_size {
            return Ok(ChunkOutcome::Pending);
        }

        let Some(done) = state.sessions.remove(&session.locator) else {
            return Err(anyhow!("upload session {} vanished", session.locator));
        };
        let item = store_file(
            &mut state,
            done.parent_id,
            &done.name,
            done.buffer,
            Utc::now(),
        )?;
        Ok(ChunkOutcome::Complete(item))
    }

    async fn download(&self, id: &RemoteId) -> Result<ByteStream> {
        let fault = self.check(RemoteCall::Download).await?;
        let (mut content, chunk, delay) = {
            let state = self.state();
            let stored = state.items.get(id).ok_or_else(|| not_found(id))?;
            (
                stored.content.clone(),
                state.download_chunk,
                state.download_delay,
            )
        };

        if fault == Some(Fault::Corrupted) {
            if let Some(first) = content.first_mut() {
                *first ^= 0xff;
            } else {
                content.push(0);
            }
        }

        let mut chunks: Vec<Result<Vec<u8>>> =
            content.chunks(chunk).map(|c| Ok(c.to_vec())).collect();
        if fault == Some(Fault::Interrupted) {
            chunks.truncate(1);
            chunks.push(Err(fault_error(RemoteCall::Download, Fault::Interrupted)));
        }

        let stream = futures_util::stream::iter(chunks).then(move |chunk| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            chunk
        });
        Ok(Box::pin(stream))
    }

    async fn list(&self, folder_id: Option<&RemoteId>) -> Result<Vec<RemoteItem>> {
        self.check(RemoteCall::List).await?;
        let state = self.state();
        if let Some(folder) = folder_id {
            if !state.items.contains_key(folder) {
                return Err(not_found(folder));
            }
        }
        let mut items: Vec<RemoteItem> = state
            .items
            .values()
            .filter(|s| s.item.parent_id.as_ref() == folder_id)
            .map(|s| s.item.clone())
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn delete(&self, id: &RemoteId) -> Result<()> {
        self.check(RemoteCall::Delete).await?;
        let mut state = self.state();
        let mut doomed = vec![id.clone()];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let current = doomed[cursor].clone();
            doomed.extend(
                state
                    .items
                    .values()
                    .filter(|s| s.item.parent_id.as_ref() == Some(&current))
                    .map(|s| s.item.id.clone()),
            );
            cursor += 1;
        }
        for id in doomed {
            state.items.remove(&id);
        }
        Ok(())
    }

    async fn move_item(
        &self,
        id: &RemoteId,
        new_parent: Option<&RemoteId>,
        new_name: &str,
    ) -> Result<RemoteItem> {
        self.check(RemoteCall::Move).await?;
        let mut state = self.state();
        if let Some(parent) = new_parent {
            if !state.items.contains_key(parent) {
                return Err(not_found(parent));
            }
        }
        let stored = state.items.get_mut(id).ok_or_else(|| not_found(id))?;
        stored.item.parent_id = new_parent.cloned();
        stored.item.name = new_name.to_string();
        Ok(stored.item.clone())
    }

    async fn create_folder(&self, parent_id: Option<&RemoteId>, name: &str) -> Result<RemoteItem> {
        self.check(RemoteCall::CreateFolder).await?;
        let mut state = self.state();
        store_folder(&mut state, parent_id.cloned(), name)
    }
}

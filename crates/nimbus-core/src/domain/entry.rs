//! PlaceholderEntry domain entity
//!
//! One `PlaceholderEntry` exists per synchronized path. It records what
//! the engine knows about the remote item, whether its content is
//! materialized on disk, and the last failure seen for it.
//!
//! ## State Machine
//!
//! ```text
//!                  hydrate                  success
//!   Placeholder ──────────┐              ┌──────────► Hydrated
//!   Dehydrated  ──────────┼─► Hydrating ─┤              │   ▲
//!   Error       ──────────┘       │      │    dehydrate │   │ failure
//!                                 │      │              ▼   │
//!                          abort  │      │          Dehydrating
//!                   (prior state) ▼      │ failure      │
//!                                        ▼              │ success
//!                                      Error            ▼
//!                                                   Dehydrated
//! ```
//!
//! `Hydrating` and `Dehydrating` are transient: an entry loaded after a
//! restart never comes back in either of them (see
//! [`PlaceholderEntry::collapse_transient`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::DomainError;
use super::newtypes::{ContentHash, RemoteId, SyncPath};
use crate::classify::{ClassifiedError, ErrorKind};

// ============================================================================
// EntryState
// ============================================================================

/// Materialization state of a placeholder entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Metadata only, content never materialized
    #[default]
    Placeholder,
    /// Content download in flight
    Hydrating,
    /// Content available on disk
    Hydrated,
    /// On-disk content being removed
    Dehydrating,
    /// Metadata only, content was materialized before
    Dehydrated,
    /// Last hydration failed, see `last_error`
    Error,
}

impl EntryState {
    /// Returns the state name as a string
    pub fn name(&self) -> &'static str {
        match self {
            EntryState::Placeholder => "placeholder",
            EntryState::Hydrating => "hydrating",
            EntryState::Hydrated => "hydrated",
            EntryState::Dehydrating => "dehydrating",
            EntryState::Dehydrated => "dehydrated",
            EntryState::Error => "error",
        }
    }

    /// Parses a name produced by [`EntryState::name`]
    pub fn from_name(name: &str) -> Option<Self> {
        let state = match name {
            "placeholder" => EntryState::Placeholder,
            "hydrating" => EntryState::Hydrating,
            "hydrated" => EntryState::Hydrated,
            "dehydrating" => EntryState::Dehydrating,
            "dehydrated" => EntryState::Dehydrated,
            "error" => EntryState::Error,
            _ => return None,
        };
        Some(state)
    }

    /// Returns true if a transfer or removal is in flight
    pub fn is_transient(&self) -> bool {
        matches!(self, EntryState::Hydrating | EntryState::Dehydrating)
    }

    /// Returns true if `hydrate` may start from this state
    pub fn is_hydratable(&self) -> bool {
        matches!(
            self,
            EntryState::Placeholder | EntryState::Dehydrated | EntryState::Error
        )
    }

    /// Returns true if content is materialized on disk
    pub fn is_local(&self) -> bool {
        matches!(self, EntryState::Hydrated)
    }

    /// Returns true if the transition `self -> target` is an edge of the
    /// state machine
    pub fn can_transition_to(&self, target: EntryState) -> bool {
        match (self, target) {
            // Start of hydration
            (EntryState::Placeholder, EntryState::Hydrating) => true,
            (EntryState::Dehydrated, EntryState::Hydrating) => true,
            (EntryState::Error, EntryState::Hydrating) => true,

            // Hydration outcome: success, failure, or abort back to the prior state
            (EntryState::Hydrating, EntryState::Hydrated) => true,
            (EntryState::Hydrating, EntryState::Error) => true,
            (EntryState::Hydrating, EntryState::Placeholder) => true,
            (EntryState::Hydrating, EntryState::Dehydrated) => true,

            // Dehydration
            (EntryState::Hydrated, EntryState::Dehydrating) => true,
            (EntryState::Dehydrating, EntryState::Dehydrated) => true,
            (EntryState::Dehydrating, EntryState::Hydrated) => true,

            _ => false,
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// EntryKind
// ============================================================================

/// File or directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Regular file
    File,
    /// Directory
    Directory,
}

impl EntryKind {
    /// Returns the kind name as a string
    pub fn name(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
        }
    }

    /// Parses a name produced by [`EntryKind::name`]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "file" => Some(EntryKind::File),
            "directory" => Some(EntryKind::Directory),
            _ => None,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// LastError
// ============================================================================

/// The most recent failure recorded against an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// Classified kind
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: String,
    /// When the failure happened
    pub at: DateTime<Utc>,
    /// Automatic retries are exhausted; only a user action clears this
    pub exhausted: bool,
}

impl LastError {
    /// Creates a new error record stamped with the current time
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
            exhausted: false,
        }
    }

    /// Marks automatic retries as exhausted
    pub fn exhausted(mut self) -> Self {
        self.exhausted = true;
        self
    }
}

impl From<&ClassifiedError> for LastError {
    fn from(error: &ClassifiedError) -> Self {
        Self {
            kind: error.kind,
            message: error.message.clone(),
            at: error.at,
            exhausted: false,
        }
    }
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if self.exhausted {
            write!(f, " (retries exhausted)")?;
        }
        Ok(())
    }
}

// ============================================================================
// PlaceholderEntry
// ============================================================================

/// Metadata for one synchronized path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderEntry {
    /// Normalized absolute path, unique within the sync root
    path: SyncPath,
    /// Remote identifier, `None` until the first upload completes
    remote_id: Option<RemoteId>,
    /// File or directory
    kind: EntryKind,
    /// Size announced by the remote or measured on upload
    declared_size: u64,
    /// Hash of the last content both sides agreed on
    content_hash: Option<ContentHash>,
    /// Materialization state
    state: EntryState,
    /// Pinned entries are never dehydrated automatically
    pinned: bool,
    /// Last known local modification time
    local_modified: Option<DateTime<Utc>>,
    /// Last known remote modification time
    remote_modified: Option<DateTime<Utc>>,
    /// Most recent failure
    last_error: Option<LastError>,
}

impl PlaceholderEntry {
    /// Creates a new entry in state `Placeholder`
    pub fn new(
        path: SyncPath,
        kind: EntryKind,
        declared_size: u64,
        remote_modified: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            path,
            remote_id: None,
            kind,
            declared_size: if kind == EntryKind::Directory {
                0
            } else {
                declared_size
            },
            content_hash: None,
            state: EntryState::Placeholder,
            pinned: false,
            local_modified: None,
            remote_modified,
            last_error: None,
        }
    }

    /// Creates a directory entry in state `Placeholder`
    pub fn new_directory(path: SyncPath) -> Self {
        Self::new(path, EntryKind::Directory, 0, None)
    }

    // --- getters ---

    pub fn path(&self) -> &SyncPath {
        &self.path
    }

    pub fn remote_id(&self) -> Option<&RemoteId> {
        self.remote_id.as_ref()
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn content_hash(&self) -> Option<&ContentHash> {
        self.content_hash.as_ref()
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn local_modified(&self) -> Option<DateTime<Utc>> {
        self.local_modified
    }

    pub fn remote_modified(&self) -> Option<DateTime<Utc>> {
        self.remote_modified
    }

    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    /// Returns true if content was on disk at some point
    pub fn was_materialized(&self) -> bool {
        self.local_modified.is_some()
    }

    /// Returns true if automatic retries gave up on this entry
    pub fn has_exhausted_error(&self) -> bool {
        self.last_error.as_ref().is_some_and(|e| e.exhausted)
    }

    // --- setters ---

    pub fn set_remote_id(&mut self, remote_id: Option<RemoteId>) {
        self.remote_id = remote_id;
    }

    pub fn set_content_hash(&mut self, hash: Option<ContentHash>) {
        self.content_hash = hash;
    }

    pub fn set_declared_size(&mut self, size: u64) {
        if self.kind == EntryKind::File {
            self.declared_size = size;
        }
    }

    pub fn set_pinned(&mut self, pinned: bool) {
        self.pinned = pinned;
    }

    pub fn set_local_modified(&mut self, time: Option<DateTime<Utc>>) {
        self.local_modified = time;
    }

    pub fn set_remote_modified(&mut self, time: Option<DateTime<Utc>>) {
        self.remote_modified = time;
    }

    pub fn set_last_error(&mut self, error: LastError) {
        self.last_error = Some(error);
    }

    pub fn clear_last_error(&mut self) {
        self.last_error = None;
    }

    /// Re-keys the entry after a rename
    pub fn set_path(&mut self, path: SyncPath) {
        self.path = path;
    }

    // --- state machine ---

    /// Returns true if the entry may move to `target`
    pub fn can_transition_to(&self, target: EntryState) -> bool {
        self.state.can_transition_to(target)
    }

    /// Attempts to transition to a new state
    ///
    /// Entering `Hydrated` clears `last_error`.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidState` if the transition is not an edge
    /// of the state machine.
    pub fn transition_to(&mut self, target: EntryState) -> Result<(), DomainError> {
        if !self.can_transition_to(target) {
            return Err(DomainError::InvalidState {
                from: self.state.name().to_string(),
                to: target.name().to_string(),
            });
        }

        if target == EntryState::Hydrated {
            self.last_error = None;
        }

        self.state = target;
        Ok(())
    }

    /// Collapses a transient state after a process restart
    ///
    /// `Hydrating` returns to `Dehydrated` when content was materialized
    /// before (a local modification time is known) and to `Placeholder`
    /// otherwise; `Dehydrating` returns to `Dehydrated`. Returns true if the
    /// state changed.
    pub fn collapse_transient(&mut self) -> bool {
        let collapsed = match self.state {
            EntryState::Hydrating if self.was_materialized() => EntryState::Dehydrated,
            EntryState::Hydrating => EntryState::Placeholder,
            EntryState::Dehydrating => EntryState::Dehydrated,
            _ => return false,
        };
        self.state = collapsed;
        true
    }
}

impl fmt::Display for PlaceholderEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} {}]", self.path, self.kind, self.state)?;
        if self.pinned {
            write!(f, " pinned")?;
        }
        Ok(())
    }
}

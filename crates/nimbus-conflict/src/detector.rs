//! Conflict detection logic
//!
//! A remote change conflicts with the local copy when both sides moved past
//! the last state they agreed on. The agreed state is what the placeholder
//! entry recorded at the last successful transfer: its content hash and
//! the local and remote modification times.

use chrono::{DateTime, Utc};
use nimbus_core::domain::{ContentHash, PlaceholderEntry, RemoteItem, SyncPath};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One side of a conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub content_hash: ContentHash,
    pub modified: DateTime<Utc>,
}

impl Version {
    pub fn new(content_hash: ContentHash, modified: DateTime<Utc>) -> Self {
        Self {
            content_hash,
            modified,
        }
    }

    /// The remote side, `None` when the remote did not report a hash
    pub fn from_remote(item: &RemoteItem) -> Option<Self> {
        item.content_hash
            .clone()
            .map(|hash| Self::new(hash, item.modified))
    }
}

/// Both versions of a path that changed on both sides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub path: SyncPath,
    pub local: Version,
    pub remote: Version,
}

/// Result of a conflict check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Safe to apply the remote change
    NoConflict,
    /// Both sides changed
    Conflicted(Conflict),
}

impl Detection {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Detection::Conflicted(_))
    }
}

/// Detects conflicts between the local file and an incoming remote change
pub struct ConflictDetector;

impl ConflictDetector {
    /// Checks a remote change against the local copy
    ///
    /// `local` describes the file currently on disk, `None` when there is no
    /// local content (placeholder, dehydrated or missing file).
    ///
    /// A conflict exists when:
    /// 1. the local file was written after the last sync and its content
    ///    differs from the synced hash, AND
    /// 2. the remote modification time is newer than the one last synced
    pub fn check_remote_change(
        entry: &PlaceholderEntry,
        local: Option<&Version>,
        remote: &Version,
    ) -> Detection {
        let Some(local) = local else {
            return Detection::NoConflict;
        };

        if !Self::local_changed(entry, local) {
            debug!(path = %entry.path(), "No local changes since last sync, no conflict");
            return Detection::NoConflict;
        }

        let remote_advanced = entry
            .remote_modified()
            .map_or(true, |synced| remote.modified > synced);
        if !remote_advanced {
            debug!(path = %entry.path(), "Remote version is not newer than last sync, no conflict");
            return Detection::NoConflict;
        }

        info!(
            path = %entry.path(),
            local_hash = %local.content_hash,
            remote_hash = %remote.content_hash,
            "Conflict detected: both local and remote versions changed"
        );
        Detection::Conflicted(Conflict {
            path: entry.path().clone(),
            local: local.clone(),
            remote: remote.clone(),
        })
    }

    /// Returns true if the local content moved away from the synced state
    pub fn local_changed(entry: &PlaceholderEntry, local: &Version) -> bool {
        let written_after_sync = entry
            .local_modified()
            .map_or(true, |synced| local.modified > synced);
        written_after_sync && entry.content_hash() != Some(&local.content_hash)
    }
}

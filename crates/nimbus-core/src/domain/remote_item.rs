//! Remote item descriptor
//!
//! What the remote store reports about a file or folder: its identifier,
//! parent, name, size, content hash and modification time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::EntryKind;
use super::newtypes::{ContentHash, RemoteId};

/// Metadata for one item held by the remote store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteItem {
    /// Remote identifier
    pub id: RemoteId,
    /// Parent folder identifier, `None` for items in the remote root
    pub parent_id: Option<RemoteId>,
    /// Item name (last path component)
    pub name: String,
    /// File or directory
    pub kind: EntryKind,
    /// Size in bytes, 0 for directories
    pub size: u64,
    /// SHA-256 of the content, when the remote knows it
    pub content_hash: Option<ContentHash>,
    /// Last modification time on the remote
    pub modified: DateTime<Utc>,
}

impl RemoteItem {
    /// Returns true if the item is a folder
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

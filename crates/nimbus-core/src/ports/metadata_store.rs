//! Persistent metadata store port (driven/secondary port)
//!
//! Durable `path -> PlaceholderEntry` mapping. The store is loaded once at
//! startup and written on every state transition.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific.
//! - The store keeps whatever it is given, including transient states;
//!   collapsing those after a restart is the state machine's job.

use crate::domain::{PlaceholderEntry, SyncPath};

/// Durable placeholder metadata
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    /// Loads every stored entry
    async fn load_all(&self) -> anyhow::Result<Vec<PlaceholderEntry>>;

    /// Inserts or replaces the entry keyed by its path
    async fn save(&self, entry: &PlaceholderEntry) -> anyhow::Result<()>;

    /// Deletes the entry at `path`; deleting a missing entry is not an error
    async fn delete(&self, path: &SyncPath) -> anyhow::Result<()>;
}

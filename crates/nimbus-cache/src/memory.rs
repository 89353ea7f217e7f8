//! Volatile metadata store
//!
//! Same contract as the SQLite store without touching disk. The daemon uses
//! it for `--ephemeral` runs; tests use it everywhere a database would only
//! slow things down.

use dashmap::DashMap;
use nimbus_core::domain::{PlaceholderEntry, SyncPath};
use nimbus_core::ports::MetadataStore;

/// In-memory implementation of the metadata store port
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    entries: DashMap<SyncPath, PlaceholderEntry>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates the store, as if a previous run had saved `entries`
    pub fn with_entries(entries: impl IntoIterator<Item = PlaceholderEntry>) -> Self {
        let store = Self::new();
        for entry in entries {
            store.entries.insert(entry.path().clone(), entry);
        }
        store
    }

    /// The stored copy of the entry at `path`
    pub fn get(&self, path: &SyncPath) -> Option<PlaceholderEntry> {
        self.entries.get(path).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait::async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn load_all(&self) -> anyhow::Result<Vec<PlaceholderEntry>> {
        let mut entries: Vec<PlaceholderEntry> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(entries)
    }

    async fn save(&self, entry: &PlaceholderEntry) -> anyhow::Result<()> {
        self.entries.insert(entry.path().clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, path: &SyncPath) -> anyhow::Result<()> {
        self.entries.remove(path);
        Ok(())
    }
}

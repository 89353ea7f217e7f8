//! SQLite implementation of MetadataStore
//!
//! One row per placeholder, keyed by its absolute path.
//!
//! ## Type Mapping
//!
//! | Domain Type   | SQL Type | Strategy                                   |
//! |---------------|----------|--------------------------------------------|
//! | SyncPath      | TEXT     | Path string, validated on load             |
//! | RemoteId      | TEXT     | String via `.as_str()`                     |
//! | ContentHash   | TEXT     | Lowercase hex via `.as_str()`              |
//! | EntryKind     | TEXT     | `.name()` / `EntryKind::from_name()`       |
//! | EntryState    | TEXT     | `.name()` / `EntryState::from_name()`      |
//! | DateTime<Utc> | TEXT     | ISO 8601 via `to_rfc3339()`                |
//! | LastError     | TEXT     | serde_json serialization                   |

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use nimbus_core::domain::{EntryKind, EntryState, LastError, PlaceholderEntry, SyncPath};
use nimbus_core::ports::MetadataStore;

use crate::CacheError;

/// SQLite-based implementation of the metadata store port
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    /// Creates a new store with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of stored entries
    pub async fn count(&self) -> Result<u64, CacheError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM placeholders")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Number of stored entries per state name
    pub async fn count_by_state(&self) -> Result<Vec<(EntryState, u64)>, CacheError> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS n FROM placeholders GROUP BY state ORDER BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let name: String = row.get("state");
                let n: i64 = row.get("n");
                parse_state(&name).map(|state| (state, n.max(0) as u64))
            })
            .collect()
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn parse_state(name: &str) -> Result<EntryState, CacheError> {
    EntryState::from_name(name)
        .ok_or_else(|| CacheError::SerializationError(format!("Unknown entry state: {}", name)))
}

/// Parse a DateTime<Utc> from an ISO 8601 string
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, CacheError> {
    match s {
        Some(ref val) if !val.is_empty() => parse_datetime(val).map(Some),
        _ => Ok(None),
    }
}

// ============================================================================
// Row mapping
// ============================================================================

/// Reconstruct a PlaceholderEntry from a database row
///
/// The entry's fields are private and only reachable through its
/// constructor and transitions, so the row is rebuilt through serde. This
/// also re-runs the newtype validation on paths, ids and hashes.
fn entry_from_row(row: &SqliteRow) -> Result<PlaceholderEntry, CacheError> {
    let path: String = row.get("path");
    let remote_id: Option<String> = row.get("remote_id");
    let kind_str: String = row.get("kind");
    let declared_size: i64 = row.get("declared_size");
    let content_hash: Option<String> = row.get("content_hash");
    let state_str: String = row.get("state");
    let pinned: bool = row.get("pinned");
    let local_modified = parse_optional_datetime(row.get("local_modified"))?;
    let remote_modified = parse_optional_datetime(row.get("remote_modified"))?;
    let last_error_str: Option<String> = row.get("last_error");

    let kind = EntryKind::from_name(&kind_str)
        .ok_or_else(|| CacheError::SerializationError(format!("Unknown kind: {}", kind_str)))?;
    let state = parse_state(&state_str)?;

    let last_error: Option<LastError> = match last_error_str {
        Some(ref s) if !s.is_empty() => Some(serde_json::from_str(s).map_err(|e| {
            CacheError::SerializationError(format!("Invalid last_error JSON for {}: {}", path, e))
        })?),
        _ => None,
    };

    let entry_json = serde_json::json!({
        "path": path,
        "remote_id": remote_id,
        "kind": kind,
        "declared_size": declared_size.max(0) as u64,
        "content_hash": content_hash,
        "state": state,
        "pinned": pinned,
        "local_modified": local_modified,
        "remote_modified": remote_modified,
        "last_error": last_error,
    });

    serde_json::from_value(entry_json).map_err(|e| {
        CacheError::SerializationError(format!("Failed to rebuild entry {}: {}", path, e))
    })
}

// ============================================================================
// MetadataStore implementation
// ============================================================================

#[async_trait::async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn load_all(&self) -> anyhow::Result<Vec<PlaceholderEntry>> {
        let rows = sqlx::query("SELECT * FROM placeholders ORDER BY path")
            .fetch_all(&self.pool)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            match entry_from_row(row) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    let path: String = row.get("path");
                    tracing::warn!(path = %path, error = %e, "Skipping unreadable placeholder row");
                }
            }
        }

        tracing::debug!(count = entries.len(), "Loaded placeholder metadata");
        Ok(entries)
    }

    async fn save(&self, entry: &PlaceholderEntry) -> anyhow::Result<()> {
        let path = entry.path().to_string();
        let remote_id = entry.remote_id().map(|r| r.as_str().to_string());
        let content_hash = entry.content_hash().map(|h| h.as_str().to_string());
        let declared_size = i64::try_from(entry.declared_size())
            .map_err(|_| anyhow::anyhow!("Declared size of {} exceeds storage range", path))?;
        let local_modified = entry.local_modified().map(|dt| dt.to_rfc3339());
        let remote_modified = entry.remote_modified().map(|dt| dt.to_rfc3339());
        let last_error = match entry.last_error() {
            Some(err) => Some(
                serde_json::to_string(err)
                    .map_err(|e| anyhow::anyhow!("Failed to serialize last_error: {}", e))?,
            ),
            None => None,
        };

        sqlx::query(
            "INSERT INTO placeholders \
             (path, remote_id, kind, declared_size, content_hash, state, pinned, \
              local_modified, remote_modified, last_error, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(path) DO UPDATE SET \
              remote_id = excluded.remote_id, \
              kind = excluded.kind, \
              declared_size = excluded.declared_size, \
              content_hash = excluded.content_hash, \
              state = excluded.state, \
              pinned = excluded.pinned, \
              local_modified = excluded.local_modified, \
              remote_modified = excluded.remote_modified, \
              last_error = excluded.last_error, \
              updated_at = excluded.updated_at",
        )
        .bind(&path)
        .bind(&remote_id)
        .bind(entry.kind().name())
        .bind(declared_size)
        .bind(&content_hash)
        .bind(entry.state().name())
        .bind(entry.is_pinned())
        .bind(&local_modified)
        .bind(&remote_modified)
        .bind(&last_error)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::trace!(path = %path, state = %entry.state(), "Saved placeholder entry");
        Ok(())
    }

    async fn delete(&self, path: &SyncPath) -> anyhow::Result<()> {
        let path = path.to_string();
        let result = sqlx::query("DELETE FROM placeholders WHERE path = ?")
            .bind(&path)
            .execute(&self.pool)
            .await?;

        tracing::trace!(path = %path, removed = result.rows_affected(), "Deleted placeholder entry");
        Ok(())
    }
}

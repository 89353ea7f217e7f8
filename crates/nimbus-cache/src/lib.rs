//! Nimbus Cache - Persistent placeholder metadata
//!
//! SQLite-backed storage for the `path -> PlaceholderEntry` mapping the
//! state machine reloads after a restart.
//!
//! ## Architecture
//!
//! This crate implements the `MetadataStore` port from `nimbus-core`. It is
//! a driven (secondary) adapter in the hexagonal architecture.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support
//! - [`SqliteMetadataStore`] - Durable `MetadataStore` implementation
//! - [`MemoryMetadataStore`] - Volatile implementation for tests and dry runs
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use nimbus_cache::{DatabasePool, SqliteMetadataStore};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/home/user/.local/share/nimbus/state.db")).await?;
//! let store = SqliteMetadataStore::new(pool.pool().clone());
//! // Hand `store` to the placeholder state machine...
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod pool;
pub mod store;

pub use memory::MemoryMetadataStore;
pub use pool::DatabasePool;
pub use store::SqliteMetadataStore;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored row does not describe a valid entry
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}

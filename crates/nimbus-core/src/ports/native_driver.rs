//! Native virtual-filesystem driver port (driven/secondary port)
//!
//! Commands flow from the placeholder state machine to the OS layer
//! through [`NativeDriver`]. Callbacks flow the other way as
//! [`DriverEvent`] messages on a channel, so the OS layer never runs
//! domain code against shared state directly.
//!
//! ## Design Notes
//!
//! - Two implementations exist: an extended-attribute driver that marks
//!   placeholder files on a real filesystem and an in-memory fake that
//!   records commands for tests.
//! - `report_progress` is fire-and-forget from the caller's point of view;
//!   implementations should not block on it.

use tokio::sync::oneshot;

use crate::domain::{PlaceholderEntry, SyncPath};

/// Commands accepted by the native layer
#[async_trait::async_trait]
pub trait NativeDriver: Send + Sync {
    /// Materializes a placeholder (empty stub file or directory) for `entry`
    async fn create_placeholder(&self, entry: &PlaceholderEntry) -> anyhow::Result<()>;

    /// Refreshes the native metadata of an existing placeholder
    async fn update_placeholder(&self, entry: &PlaceholderEntry) -> anyhow::Result<()>;

    /// Removes the placeholder and any content at `path`
    async fn delete_placeholder(&self, path: &SyncPath) -> anyhow::Result<()>;

    /// Reports hydration progress in `0.0..=1.0`
    async fn report_progress(&self, path: &SyncPath, fraction: f64) -> anyhow::Result<()>;
}

/// Reply channel for a hydration request raised by the native layer
pub type HydrationReply = oneshot::Sender<Result<(), String>>;

/// Callbacks raised by the native layer
#[derive(Debug)]
pub enum DriverEvent {
    /// A process opened a placeholder and needs its content
    HydrationRequested {
        /// Placeholder path
        path: SyncPath,
        /// Completed once content is in place or hydration failed
        reply: Option<HydrationReply>,
    },
    /// The user asked to free the space used by a file
    DehydrationRequested {
        /// Hydrated path
        path: SyncPath,
    },
    /// An entry was renamed or moved through the native layer
    Rename {
        /// Previous path
        old_path: SyncPath,
        /// New path
        new_path: SyncPath,
    },
    /// An entry was deleted through the native layer
    Delete {
        /// Deleted path
        path: SyncPath,
    },
}

impl DriverEvent {
    /// Returns the primary path of the event
    pub fn path(&self) -> &SyncPath {
        match self {
            DriverEvent::HydrationRequested { path, .. } => path,
            DriverEvent::DehydrationRequested { path } => path,
            DriverEvent::Rename { new_path, .. } => new_path,
            DriverEvent::Delete { path } => path,
        }
    }
}

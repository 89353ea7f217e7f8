//! Conflict resolution policy
//!
//! - Equal content hashes: the sides already converged, nothing to do.
//! - Otherwise the later modification time wins; on a tie the remote wins.
//!
//! The losing copy is never discarded: it is kept under a conflict name
//! produced by [`ConflictNamer`] and synchronized as a new file.

use serde::{Deserialize, Serialize};
use tracing::info;

use nimbus_core::domain::SyncPath;

use crate::{detector::Conflict, error::ConflictError, namer::ConflictNamer};

/// Outcome of the resolution policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Both sides hold the same bytes
    Converged,
    /// Local content is uploaded; the remote copy goes to the conflict name
    LocalWins,
    /// Remote content is applied; the local copy goes to the conflict name
    RemoteWins,
}

impl Resolution {
    pub fn name(&self) -> &'static str {
        match self {
            Resolution::Converged => "converged",
            Resolution::LocalWins => "local_wins",
            Resolution::RemoteWins => "remote_wins",
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What the orchestrator has to do for one conflict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionPlan {
    pub resolution: Resolution,
    /// Where the losing copy is kept; `None` when converged
    pub conflict_path: Option<SyncPath>,
}

/// Decides conflicts and names the losing copies
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    namer: ConflictNamer,
}

impl ConflictResolver {
    pub fn new(namer: ConflictNamer) -> Self {
        Self { namer }
    }

    pub fn namer(&self) -> &ConflictNamer {
        &self.namer
    }

    /// Applies the policy to `conflict`
    pub fn decide(conflict: &Conflict) -> Resolution {
        if conflict.local.content_hash == conflict.remote.content_hash {
            Resolution::Converged
        } else if conflict.local.modified > conflict.remote.modified {
            Resolution::LocalWins
        } else {
            Resolution::RemoteWins
        }
    }

    /// Decides `conflict` and picks a free conflict path for the loser
    ///
    /// `exists` reports whether a candidate path is already taken, on disk
    /// or in the placeholder metadata.
    pub fn plan<F>(&self, conflict: &Conflict, exists: F) -> Result<ResolutionPlan, ConflictError>
    where
        F: FnMut(&SyncPath) -> bool,
    {
        let resolution = Self::decide(conflict);
        let conflict_path = match resolution {
            Resolution::Converged => None,
            Resolution::LocalWins | Resolution::RemoteWins => {
                Some(self.namer.conflict_path(&conflict.path, exists)?)
            }
        };

        info!(
            path = %conflict.path,
            resolution = %resolution,
            conflict_path = ?conflict_path.as_ref().map(ToString::to_string),
            "Conflict resolved by policy"
        );
        Ok(ResolutionPlan {
            resolution,
            conflict_path,
        })
    }
}

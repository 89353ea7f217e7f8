//! Error types for the conflict engine

use thiserror::Error;

use nimbus_core::domain::DomainError;

/// Errors that can occur during conflict resolution
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Every candidate conflict name is already taken
    #[error("no free conflict name for {path} after {attempts} attempts")]
    NamesExhausted { path: String, attempts: u32 },

    /// The path has no file name to derive a conflict name from
    #[error("cannot derive a conflict name from {0}")]
    Unnamed(String),

    /// The derived path is not valid
    #[error(transparent)]
    Domain(#[from] DomainError),
}

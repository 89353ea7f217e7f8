//! Domain error types
//!
//! This module defines error types specific to domain operations:
//! path validation, placeholder state transitions and the placeholder
//! preconditions (`AccessDenied`, `PathOutsideRoot`, `KindConflict`,
//! `Pinned`, `Busy`) that are surfaced to the caller without retry.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// The caller may not touch the given path
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Path is not within the configured sync root
    #[error("Path {path} is outside sync root {root}")]
    PathOutsideRoot {
        /// The rejected path
        path: String,
        /// The sync root it was checked against
        root: String,
    },

    /// An entry already exists at the path with a different kind
    #[error("Kind conflict at {path}: existing {existing}, requested {requested}")]
    KindConflict {
        /// The conflicting path
        path: String,
        /// Kind of the entry already registered
        existing: String,
        /// Kind the caller asked for
        requested: String,
    },

    /// The entry is pinned and may not be dehydrated
    #[error("Entry is pinned: {0}")]
    Pinned(String),

    /// Another operation is in flight for the entry
    #[error("Entry is busy: {0}")]
    Busy(String),

    /// No entry is registered at the path
    #[error("No entry registered at {0}")]
    NotFound(String),

    /// Invalid remote ID format
    #[error("Invalid remote ID: {0}")]
    InvalidRemoteId(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),
}

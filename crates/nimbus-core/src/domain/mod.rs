//! Domain entities and business logic
//!
//! This module contains the core domain types for Nimbus:
//! - Newtypes for type-safe identifiers and validated domain types
//! - Placeholder entries and their state machine
//! - Queued sync operations
//! - Remote item descriptors
//! - Domain-specific error types

pub mod entry;
pub mod errors;
pub mod newtypes;
pub mod operation;
pub mod remote_item;

// Re-export commonly used types
pub use entry::{EntryKind, EntryState, LastError, PlaceholderEntry};
pub use errors::DomainError;
pub use newtypes::*;
pub use operation::{OperationKind, Source, Status, SyncOperation};
pub use remote_item::RemoteItem;

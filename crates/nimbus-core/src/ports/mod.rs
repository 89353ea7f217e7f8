//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the domain core
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`RemoteStorage`] - Remote object store (upload, download, list, delete, move)
//! - [`NativeDriver`] - Commands to the OS virtual-filesystem layer, plus [`DriverEvent`] callbacks
//! - [`MetadataStore`] - Durable placeholder metadata
//! - [`TokenProvider`] - Opaque bearer tokens for the remote API
//! - [`ConnectivityNotifier`] - Connectivity-issue notifications

pub mod metadata_store;
pub mod native_driver;
pub mod notification;
pub mod remote_storage;

pub use metadata_store::MetadataStore;
pub use native_driver::{DriverEvent, HydrationReply, NativeDriver};
pub use notification::{ConnectivityNotifier, LogNotifier};
pub use remote_storage::{
    ByteStream, ChunkOutcome, RemoteStorage, StaticToken, TokenProvider, UploadSession,
};

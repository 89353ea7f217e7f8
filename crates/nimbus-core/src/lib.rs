//! Nimbus Core - Domain types and boundaries of the sync engine
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `PlaceholderEntry`, `SyncOperation`, `RemoteItem`, validated newtypes
//! - **State machine** - the placeholder lifecycle and its legal transitions
//! - **Error classification** - `ErrorKind`, `ClassifiedError` and the `ErrorReporter`
//! - **Port definitions** - `RemoteStorage`, `NativeDriver`, `MetadataStore`, `ConnectivityNotifier`
//! - **Configuration** - the YAML configuration file and its validation
//!
//! # Architecture
//!
//! The domain module holds pure types with no I/O. Ports define trait
//! interfaces that adapter crates (`nimbus-transfer`, `nimbus-cache`,
//! `nimbus-placeholder`) implement, and `nimbus-sync` drives them.

pub mod classify;
pub mod config;
pub mod domain;
pub mod ports;

//! Integration tests for nimbus-sync
//!
//! The orchestrator runs end to end against the in-memory remote and the
//! in-memory native driver, with real files in a temporary sync root. The
//! watcher tests use the OS notification backend.

mod common;

mod test_orchestrator;
mod test_scanner;
mod test_watcher;

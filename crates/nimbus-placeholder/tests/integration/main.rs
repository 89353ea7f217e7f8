//! Integration tests for nimbus-placeholder
//!
//! The state machine runs against the in-memory remote, the in-memory
//! native driver and a volatile metadata store, with real files in a
//! temporary sync root.

mod common;

mod test_bridge;
mod test_hydration;
mod test_lifecycle;
mod test_reclaim;

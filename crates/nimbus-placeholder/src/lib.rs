//! Nimbus Placeholder - Files-on-demand state machine
//!
//! Provides:
//! - The placeholder state machine (register, hydrate, dehydrate, pin)
//! - The bridge that turns native driver callbacks into domain operations
//! - Two native drivers: extended-attribute stubs and an in-memory fake
//! - Automatic space reclamation
//!
//! # Architecture
//!
//! The state machine is the only writer of placeholder metadata:
//! - [`PlaceholderStateMachine`] owns the path-keyed entry arena
//! - [`XattrDriver`] marks placeholders on a real filesystem
//! - [`InMemoryDriver`] records commands for tests
//! - [`ReclaimManager`] dehydrates unpinned files under disk pressure
//!
//! # Usage
//!
//! ```ignore
//! use nimbus_placeholder::{PlaceholderStateMachine, Registration, XattrDriver};
//!
//! let machine = PlaceholderStateMachine::new(root, Arc::new(XattrDriver::new()), store, pipeline, reporter);
//! machine.load().await?;
//! machine.register_placeholder(&path, Registration::from_remote(&item)).await?;
//! machine.hydrate(&path, OpContext::new("hydrate")).await?;
//! ```

pub mod driver;
pub mod error;
pub mod machine;
pub mod reclaim;
#[cfg(target_os = "linux")]
pub mod xattr;

pub use driver::{DriverCommand, InMemoryDriver};
pub use error::PlaceholderError;
pub use machine::{HydrationOutcome, PlaceholderStateMachine, Registration};
pub use reclaim::{hydrated_usage, ReclaimManager, ReclaimPolicy, ReclaimReport};
#[cfg(target_os = "linux")]
pub use xattr::XattrDriver;

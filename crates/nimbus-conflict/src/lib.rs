//! Nimbus Conflict - Conflict detection and resolution
//!
//! Provides:
//! - Timestamp-based conflict detection against the last synced state
//! - The resolution policy (equal hashes converge, later write wins)
//! - Conflict copy naming (`name (conflict).ext`)

pub mod detector;
pub mod error;
pub mod namer;
pub mod resolver;

pub use detector::{Conflict, ConflictDetector, Detection, Version};
pub use error::ConflictError;
pub use namer::ConflictNamer;
pub use resolver::{ConflictResolver, Resolution, ResolutionPlan};

//! Error types for the placeholder state machine.
//!
//! Defines `PlaceholderError` and the mapping of its variants onto the
//! classifier's taxonomy.

use nimbus_core::{
    classify::{classify_kind, domain_kind, ErrorKind},
    domain::DomainError,
};
use thiserror::Error;

/// Errors raised by placeholder operations before any transfer starts.
///
/// Transfer failures are not returned here: they are classified and
/// reported through `HydrationOutcome::Failed`.
#[derive(Error, Debug)]
pub enum PlaceholderError {
    /// Precondition rejected by the domain (pinned, busy, kind conflict, ...)
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("native driver error: {0:#}")]
    Driver(anyhow::Error),

    #[error("metadata store error: {0:#}")]
    Store(anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlaceholderError {
    /// Classified kind for this error
    ///
    /// Domain preconditions keep their own kind; driver and store failures
    /// go through the classifier.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlaceholderError::Domain(e) => domain_kind(e).unwrap_or(ErrorKind::Unknown),
            PlaceholderError::Driver(e) | PlaceholderError::Store(e) => classify_kind(e),
            PlaceholderError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorKind::AccessDenied
            }
            _ => ErrorKind::Unknown,
        }
    }

    pub(crate) fn not_found(path: impl std::fmt::Display) -> Self {
        PlaceholderError::NotFound(path.to_string())
    }
}

impl From<PlaceholderError> for libc::c_int {
    fn from(err: PlaceholderError) -> libc::c_int {
        match err {
            PlaceholderError::NotFound(_) => libc::ENOENT,
            PlaceholderError::Domain(DomainError::AccessDenied(_)) => libc::EACCES,
            PlaceholderError::Domain(DomainError::Busy(_)) => libc::EBUSY,
            PlaceholderError::Domain(DomainError::Pinned(_)) => libc::EPERM,
            PlaceholderError::Domain(DomainError::KindConflict { .. }) => libc::EEXIST,
            PlaceholderError::Domain(_) => libc::EINVAL,
            PlaceholderError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            PlaceholderError::Driver(_) | PlaceholderError::Store(_) => libc::EIO,
        }
    }
}

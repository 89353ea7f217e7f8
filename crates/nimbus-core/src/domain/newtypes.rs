//! Domain newtypes with validation
//!
//! This module provides strongly-typed wrappers for domain identifiers and values.
//! Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// UUID-based ID types
// ============================================================================

/// Identifier of a single queued [`SyncOperation`](super::SyncOperation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new random OperationId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an OperationId from an existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID value
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Create a nil (all zeros) OperationId
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for OperationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid UUID: {e}")))
    }
}

// ============================================================================
// Path types
// ============================================================================

/// A validated absolute path, the unique key of a placeholder entry
///
/// SyncPath ensures the path is:
/// - Absolute (starts with /)
/// - Normalized (no . or .. components, no trailing separator)
/// - Within the sync root when validated against one
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "PathBuf", into = "PathBuf")]
pub struct SyncPath(PathBuf);

impl SyncPath {
    /// Create a new SyncPath, validating it is absolute
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path is not absolute
    pub fn new(path: PathBuf) -> Result<Self, DomainError> {
        if !path.is_absolute() {
            return Err(DomainError::InvalidPath(format!(
                "Path must be absolute: {}",
                path.display()
            )));
        }

        // We don't use fs::canonicalize() as the path might not exist yet
        let normalized = Self::normalize_path(&path)?;
        Ok(Self(normalized))
    }

    /// Create a SyncPath validated against a sync root
    ///
    /// # Errors
    /// Returns `DomainError::PathOutsideRoot` if path is not within the sync root
    pub fn new_within_root(path: PathBuf, sync_root: &SyncPath) -> Result<Self, DomainError> {
        let sync_path = Self::new(path)?;

        if !sync_path.is_within(sync_root) {
            return Err(DomainError::PathOutsideRoot {
                path: sync_path.to_string(),
                root: sync_root.to_string(),
            });
        }

        Ok(sync_path)
    }

    /// Get the inner path reference
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Convert to owned PathBuf
    #[must_use]
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    /// Whether this path equals `ancestor` or lies beneath it
    #[must_use]
    pub fn is_within(&self, ancestor: &SyncPath) -> bool {
        self.0.starts_with(&ancestor.0)
    }

    /// Whether this path lies strictly beneath `ancestor`
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &SyncPath) -> bool {
        self != ancestor && self.is_within(ancestor)
    }

    /// Parent path, `None` for `/`
    #[must_use]
    pub fn parent(&self) -> Option<SyncPath> {
        self.0.parent().map(|p| Self(p.to_path_buf()))
    }

    /// Final component as UTF-8, if any
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|n| n.to_str())
    }

    /// Get the path relative to a root
    ///
    /// # Errors
    /// Returns error if this path is not within the root
    pub fn relative_to(&self, root: &SyncPath) -> Result<PathBuf, DomainError> {
        self.0
            .strip_prefix(&root.0)
            .map(|p| p.to_path_buf())
            .map_err(|_| DomainError::PathOutsideRoot {
                path: self.to_string(),
                root: root.to_string(),
            })
    }

    /// Join a relative path to this SyncPath
    ///
    /// # Errors
    /// Returns error if the component contains invalid sequences
    pub fn join(&self, component: &str) -> Result<Self, DomainError> {
        // Prevent path traversal
        if component.contains("..") || component.starts_with('/') {
            return Err(DomainError::InvalidPath(format!(
                "Invalid path component: {component}"
            )));
        }

        Self::new(self.0.join(component))
    }

    /// Move this path from under `from` to under `to`
    ///
    /// Used when a directory is renamed and every descendant key has to
    /// follow it.
    ///
    /// # Errors
    /// Returns error if this path is not within `from`
    pub fn rebase(&self, from: &SyncPath, to: &SyncPath) -> Result<Self, DomainError> {
        let relative = self.relative_to(from)?;
        if relative.as_os_str().is_empty() {
            return Ok(to.clone());
        }
        Self::new(to.0.join(relative))
    }

    /// Normalize a path by resolving . and .. components
    fn normalize_path(path: &Path) -> Result<PathBuf, DomainError> {
        use std::path::Component;

        let mut normalized = PathBuf::new();

        for component in path.components() {
            match component {
                Component::Prefix(p) => normalized.push(p.as_os_str()),
                Component::RootDir => normalized.push("/"),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(DomainError::InvalidPath(
                            "Path escapes root via ..".to_string(),
                        ));
                    }
                }
                Component::Normal(c) => normalized.push(c),
            }
        }

        Ok(normalized)
    }
}

impl Display for SyncPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl TryFrom<PathBuf> for SyncPath {
    type Error = DomainError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::new(path)
    }
}

impl From<SyncPath> for PathBuf {
    fn from(sync_path: SyncPath) -> Self {
        sync_path.0
    }
}

impl AsRef<Path> for SyncPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

// ============================================================================
// Remote storage types
// ============================================================================

/// Opaque identifier assigned by the remote store
///
/// Any non-empty string without whitespace or path separators is accepted;
/// the remote decides the actual format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteId(String);

impl RemoteId {
    /// Create a new RemoteId
    ///
    /// # Errors
    /// Returns error if the ID is empty or contains whitespace or `/`
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DomainError::InvalidRemoteId(
                "Remote ID cannot be empty".to_string(),
            ));
        }

        if id.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(DomainError::InvalidRemoteId(format!(
                "Remote ID contains invalid characters: {id}"
            )));
        }

        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RemoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemoteId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RemoteId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RemoteId> for String {
    fn from(id: RemoteId) -> Self {
        id.0
    }
}

/// Lower-case hex SHA-256 of a file's bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Length of a hex-encoded SHA-256 digest
    const HEX_LEN: usize = 64;

    /// Hash of zero bytes
    pub const EMPTY: &'static str =
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    /// Create a new ContentHash from its hex form
    ///
    /// Upper-case input is accepted and folded to lower case.
    ///
    /// # Errors
    /// Returns error if the value is not 64 hex characters
    pub fn new(hash: impl Into<String>) -> Result<Self, DomainError> {
        let hash = hash.into().to_ascii_lowercase();
        if hash.len() != Self::HEX_LEN || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DomainError::ValidationFailed(format!(
                "Content hash must be {} hex characters: {hash}",
                Self::HEX_LEN
            )));
        }
        Ok(Self(hash))
    }

    /// Build a hash from raw digest bytes
    #[must_use]
    pub fn from_digest(digest: &[u8]) -> Self {
        use std::fmt::Write;

        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    /// Hash of an empty file
    #[must_use]
    pub fn empty() -> Self {
        Self(Self::EMPTY.to_string())
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContentHash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

//! Write log for echo suppression
//!
//! Every write the engine performs inside the sync root (a published
//! download, a truncated dehydration, a removal) is recorded here as
//! `(path, fingerprint, written_at)`. The watcher consults the log before
//! emitting an event: an event whose path and resulting content match a
//! fresh record is the engine's own echo and is dropped.
//!
//! Records expire after a short TTL (about two seconds). After that an
//! identical external edit is treated as a genuine change.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use nimbus_core::domain::ContentHash;
use tracing::trace;

/// Default lifetime of a write record
pub const DEFAULT_ECHO_TTL: Duration = Duration::from_secs(2);

/// What the engine left at a path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    /// A file with this content
    Content(ContentHash),
    /// A directory the engine created
    Directory,
    /// Nothing: the engine removed the path
    Removed,
}

#[derive(Debug, Clone)]
struct WriteRecord {
    fingerprint: Fingerprint,
    written_at: Instant,
}

/// Short-lived record of the engine's own writes
#[derive(Debug)]
pub struct WriteLog {
    records: DashMap<PathBuf, WriteRecord>,
    ttl: Duration,
}

impl WriteLog {
    /// Creates an empty log with the given record lifetime
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            ttl,
        }
    }

    /// Record lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Records a write performed now
    pub fn record(&self, path: &Path, fingerprint: Fingerprint) {
        self.record_at(path, fingerprint, Instant::now());
    }

    /// Records a write performed at `at`
    pub fn record_at(&self, path: &Path, fingerprint: Fingerprint, at: Instant) {
        trace!(path = %path.display(), ?fingerprint, "Recording engine write");
        self.records.insert(
            path.to_path_buf(),
            WriteRecord {
                fingerprint,
                written_at: at,
            },
        );
    }

    /// Returns true if a fresh record exists for `path`, whatever it holds
    ///
    /// The watcher uses this to skip hashing files the engine never touched.
    pub fn has_recent(&self, path: &Path) -> bool {
        self.has_recent_at(path, Instant::now())
    }

    /// [`has_recent`](Self::has_recent) evaluated at `now`
    pub fn has_recent_at(&self, path: &Path, now: Instant) -> bool {
        self.records
            .get(path)
            .is_some_and(|r| now.saturating_duration_since(r.written_at) <= self.ttl)
    }

    /// Returns true if a fresh record for `path` matches `observed`
    pub fn is_echo(&self, path: &Path, observed: &Fingerprint) -> bool {
        self.is_echo_at(path, observed, Instant::now())
    }

    /// [`is_echo`](Self::is_echo) evaluated at `now`
    pub fn is_echo_at(&self, path: &Path, observed: &Fingerprint, now: Instant) -> bool {
        self.records.get(path).is_some_and(|r| {
            now.saturating_duration_since(r.written_at) <= self.ttl && &r.fingerprint == observed
        })
    }

    /// Drops the record for `path`
    pub fn forget(&self, path: &Path) {
        self.records.remove(path);
    }

    /// Drops every expired record and returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records
            .retain(|_, r| now.saturating_duration_since(r.written_at) <= self.ttl);
        before - self.records.len()
    }

    /// Number of records currently held
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no records are held
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for WriteLog {
    fn default() -> Self {
        Self::new(DEFAULT_ECHO_TTL)
    }
}

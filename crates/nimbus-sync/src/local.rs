//! Local filesystem inspection
//!
//! Stat snapshots and content hashes of files under the sync root. The
//! orchestrator compares these against placeholder metadata to tell user
//! edits from stubs and from the engine's own writes.
//!
//! Hashes are lower-case hex SHA-256 of the file bytes, the same digest the
//! transfer pipeline computes while streaming.

use std::{io::ErrorKind, path::Path, time::SystemTime};

use chrono::{DateTime, Utc};
use nimbus_core::domain::ContentHash;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

const READ_BUFFER: usize = 64 * 1024;

/// What a `stat` of a path returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl FileStat {
    fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            modified: metadata.modified().ok().and_then(to_utc),
        }
    }
}

/// Stats `path`, returning `None` if it does not exist
///
/// Symlinks are not followed.
pub async fn stat(path: &Path) -> std::io::Result<Option<FileStat>> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => Ok(Some(FileStat::from_metadata(&metadata))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Streams the file at `path` through SHA-256
#[instrument(level = "debug", fields(path = %path.display()))]
pub async fn hash_file(path: &Path) -> std::io::Result<ContentHash> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER];
    let mut total = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    let hash = ContentHash::from_digest(&hasher.finalize());
    debug!(bytes = total, hash = %hash, "Hash computed");
    Ok(hash)
}

fn to_utc(time: SystemTime) -> Option<DateTime<Utc>> {
    let since_epoch = time.duration_since(SystemTime::UNIX_EPOCH).ok()?;
    DateTime::from_timestamp(
        i64::try_from(since_epoch.as_secs()).ok()?,
        since_epoch.subsec_nanos(),
    )
}

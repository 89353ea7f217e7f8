//! Extended-attribute native driver.
//!
//! Placeholders live on a regular filesystem: a file placeholder is a
//! zero-length file, a directory placeholder is a plain directory. The
//! placeholder metadata is attached as extended attributes so file
//! managers and shell extensions can show the hydration state.
//!
//! ## Supported Extended Attributes
//!
//! - `user.nimbus.state` - Placeholder state name (`placeholder`, `hydrated`, ...)
//! - `user.nimbus.size` - Declared size in bytes
//! - `user.nimbus.remote_id` - Remote identifier, absent until the first upload
//! - `user.nimbus.pinned` - `1` when pinned, `0` otherwise
//! - `user.nimbus.progress` - Hydration progress `0`..`100`, only while hydrating
//!
//! Filesystems without user xattr support still get the stub files; the
//! attributes are skipped with a debug record.

use std::{
    ffi::CString,
    io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use nimbus_core::{
    domain::{EntryState, PlaceholderEntry, SyncPath},
    ports::NativeDriver,
};
use tracing::{debug, trace};

// ============================================================================
// Constants for xattr namespace
// ============================================================================

/// Extended attribute for the placeholder state.
pub const XATTR_STATE: &str = "user.nimbus.state";

/// Extended attribute for the declared size, as a decimal string.
pub const XATTR_SIZE: &str = "user.nimbus.size";

/// Extended attribute for the remote identifier.
pub const XATTR_REMOTE_ID: &str = "user.nimbus.remote_id";

/// Extended attribute for the pin flag.
pub const XATTR_PINNED: &str = "user.nimbus.pinned";

/// Extended attribute for hydration progress.
pub const XATTR_PROGRESS: &str = "user.nimbus.progress";

/// Returns a list of all attribute names written by the driver.
#[must_use]
pub fn list_xattrs() -> Vec<&'static str> {
    vec![
        XATTR_STATE,
        XATTR_SIZE,
        XATTR_REMOTE_ID,
        XATTR_PINNED,
        XATTR_PROGRESS,
    ]
}

// ============================================================================
// Syscall wrappers
// ============================================================================

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains a NUL byte"))
}

/// Sets `name` to `value` on `path`.
pub fn set_xattr(path: &Path, name: &str, value: &[u8]) -> io::Result<()> {
    let c_path = c_path(path)?;
    let c_name = c_name(name)?;
    // SAFETY: both strings are NUL-terminated and outlive the call; the value
    // pointer is valid for `value.len()` bytes.
    let rc = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Reads `name` from `path`; `None` when the attribute is not set.
pub fn get_xattr(path: &Path, name: &str) -> io::Result<Option<Vec<u8>>> {
    let c_path = c_path(path)?;
    let c_name = c_name(name)?;

    loop {
        // SAFETY: a null buffer with size 0 asks for the value length only.
        let len = unsafe {
            libc::getxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0)
        };
        if len < 0 {
            let err = io::Error::last_os_error();
            return if err.raw_os_error() == Some(libc::ENODATA) {
                Ok(None)
            } else {
                Err(err)
            };
        }

        let mut buf = vec![0u8; len as usize];
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let read = unsafe {
            libc::getxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if read >= 0 {
            buf.truncate(read as usize);
            return Ok(Some(buf));
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // value grew between the two calls
            Some(libc::ERANGE) => continue,
            Some(libc::ENODATA) => return Ok(None),
            _ => return Err(err),
        }
    }
}

/// Removes `name` from `path`; a missing attribute is not an error.
pub fn remove_xattr(path: &Path, name: &str) -> io::Result<()> {
    let c_path = c_path(path)?;
    let c_name = c_name(name)?;
    // SAFETY: both strings are NUL-terminated and outlive the call.
    let rc = unsafe { libc::removexattr(c_path.as_ptr(), c_name.as_ptr()) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENODATA) {
        Ok(())
    } else {
        Err(err)
    }
}

fn is_unsupported(err: &io::Error) -> bool {
    err.raw_os_error()
        .is_some_and(|code| code == libc::ENOTSUP || code == libc::EOPNOTSUPP)
}

// ============================================================================
// Attribute snapshot
// ============================================================================

/// Placeholder attributes as read back from disk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaceholderAttributes {
    pub state: Option<EntryState>,
    pub size: Option<u64>,
    pub remote_id: Option<String>,
    pub pinned: bool,
    pub progress: Option<u8>,
}

fn read_string(path: &Path, name: &str) -> io::Result<Option<String>> {
    Ok(get_xattr(path, name)?.map(|v| String::from_utf8_lossy(&v).into_owned()))
}

/// Reads every `user.nimbus.*` attribute of `path`.
pub fn read_attributes(path: &Path) -> io::Result<PlaceholderAttributes> {
    Ok(PlaceholderAttributes {
        state: read_string(path, XATTR_STATE)?.and_then(|s| EntryState::from_name(&s)),
        size: read_string(path, XATTR_SIZE)?.and_then(|s| s.parse().ok()),
        remote_id: read_string(path, XATTR_REMOTE_ID)?,
        pinned: read_string(path, XATTR_PINNED)?.as_deref() == Some("1"),
        progress: read_string(path, XATTR_PROGRESS)?.and_then(|s| s.parse().ok()),
    })
}

fn write_attributes(path: &Path, entry: &PlaceholderEntry) -> io::Result<()> {
    set_xattr(path, XATTR_STATE, entry.state().name().as_bytes())?;
    set_xattr(path, XATTR_SIZE, entry.declared_size().to_string().as_bytes())?;
    set_xattr(path, XATTR_PINNED, if entry.is_pinned() { b"1" } else { b"0" })?;
    match entry.remote_id() {
        Some(id) => set_xattr(path, XATTR_REMOTE_ID, id.as_str().as_bytes())?,
        None => remove_xattr(path, XATTR_REMOTE_ID)?,
    }
    if entry.state() != EntryState::Hydrating {
        remove_xattr(path, XATTR_PROGRESS)?;
    }
    Ok(())
}

// ============================================================================
// XattrDriver
// ============================================================================

/// Native driver backed by stub files and extended attributes
#[derive(Debug, Clone, Copy, Default)]
pub struct XattrDriver;

impl XattrDriver {
    pub fn new() -> Self {
        Self
    }

    /// Runs a blocking attribute update, tolerating filesystems without xattrs
    async fn with_attributes<F>(path: PathBuf, f: F) -> anyhow::Result<()>
    where
        F: FnOnce(&Path) -> io::Result<()> + Send + 'static,
    {
        let result = tokio::task::spawn_blocking(move || {
            let result = f(&path);
            (path, result)
        })
        .await?;

        match result {
            (_, Ok(())) => Ok(()),
            (path, Err(e)) if is_unsupported(&e) => {
                debug!(path = %path.display(), "Filesystem has no user xattr support");
                Ok(())
            }
            (path, Err(e)) => Err(anyhow::Error::new(e)
                .context(format!("updating attributes of {}", path.display()))),
        }
    }
}

#[async_trait::async_trait]
impl NativeDriver for XattrDriver {
    async fn create_placeholder(&self, entry: &PlaceholderEntry) -> anyhow::Result<()> {
        let path = entry.path().as_path().to_path_buf();
        if entry.is_directory() {
            tokio::fs::create_dir_all(&path).await?;
        } else {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // existing content is never truncated here
            tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await?;
        }
        trace!(path = %path.display(), "Placeholder stub created");

        let entry = entry.clone();
        Self::with_attributes(path, move |p| write_attributes(p, &entry)).await
    }

    async fn update_placeholder(&self, entry: &PlaceholderEntry) -> anyhow::Result<()> {
        let path = entry.path().as_path().to_path_buf();
        if !tokio::fs::try_exists(&path).await? {
            debug!(path = %path.display(), "Skipping attribute update of missing placeholder");
            return Ok(());
        }
        let entry = entry.clone();
        Self::with_attributes(path, move |p| write_attributes(p, &entry)).await
    }

    async fn delete_placeholder(&self, path: &SyncPath) -> anyhow::Result<()> {
        let path = path.as_path();
        match tokio::fs::symlink_metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await?,
            Ok(_) => tokio::fs::remove_file(path).await?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn report_progress(&self, path: &SyncPath, fraction: f64) -> anyhow::Result<()> {
        let percent = (fraction.clamp(0.0, 1.0) * 100.0).round() as u8;
        let path = path.as_path().to_path_buf();
        if !tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        Self::with_attributes(path, move |p| {
            set_xattr(p, XATTR_PROGRESS, percent.to_string().as_bytes())
        })
        .await
    }
}

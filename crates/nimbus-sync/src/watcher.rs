//! File watching, debouncing and echo suppression
//!
//! [`FileWatcher::watch`] wraps the `notify` crate and turns raw OS
//! notifications into a stream of semantic [`WatchEvent`]s.
//!
//! ## Architecture
//!
//! ```text
//! inotify / kqueue
//!       │  (notify callback thread)
//!       ▼
//!  mpsc::channel ──► Debouncer ──► classify ──► echo check ──► WatchStream
//!                    (per path,    (stat the     (WriteLog)
//!                     sliding)      final state)
//! ```
//!
//! ## Debouncing
//!
//! Raw changes for one path are held while they keep arriving less than the
//! window apart. When the path goes quiet the first and last raw kinds
//! decide the net effect: `Add` followed by anything but a removal is still
//! an `Add`, anything ending in a removal is an `Unlink`, and an `Add` that
//! is removed again inside the window produces nothing at all.
//!
//! ## Failures
//!
//! Any error from the OS watcher is fatal: it is delivered once as
//! `Err(WatcherError)` and the stream ends. Callers must stop syncing rather
//! than work from a stale view of the tree.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use futures_util::Stream;
use nimbus_core::{
    config::WatcherConfig,
    domain::{OperationKind, SyncPath},
};
use nimbus_transfer::{is_partial_path, Fingerprint, WriteLog};
use notify::{
    event::{CreateKind, MetadataKind, ModifyKind, RemoveKind, RenameMode},
    EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    local::{self, FileStat},
    WatcherError,
};

/// Capacity of the raw notification and output channels
const CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// Semantic events
// ============================================================================

/// Kind of a debounced local change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Add,
    Change,
    Unlink,
    AddDir,
    UnlinkDir,
}

impl WatchEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            WatchEventKind::Add => "add",
            WatchEventKind::Change => "change",
            WatchEventKind::Unlink => "unlink",
            WatchEventKind::AddDir => "add_dir",
            WatchEventKind::UnlinkDir => "unlink_dir",
        }
    }
}

impl std::fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl From<WatchEventKind> for OperationKind {
    fn from(kind: WatchEventKind) -> Self {
        match kind {
            WatchEventKind::Add => OperationKind::Add,
            WatchEventKind::Change => OperationKind::Change,
            WatchEventKind::Unlink => OperationKind::Unlink,
            WatchEventKind::AddDir => OperationKind::AddDir,
            WatchEventKind::UnlinkDir => OperationKind::UnlinkDir,
        }
    }
}

/// One settled local change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: SyncPath,
    /// State of the path when the event was emitted; `None` for removals
    pub stat: Option<FileStat>,
}

// ============================================================================
// Raw changes
// ============================================================================

/// Raw notification kind, before debouncing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Created,
    Modified,
    Removed,
}

/// A raw notification for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChange {
    pub kind: RawKind,
    pub path: PathBuf,
    /// Whether the OS said the path is a directory, when it said anything
    pub is_dir: Option<bool>,
}

impl RawChange {
    pub fn new(kind: RawKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            is_dir: None,
        }
    }

    fn with_dir_hint(mut self, is_dir: Option<bool>) -> Self {
        self.is_dir = is_dir;
        self
    }
}

/// Converts a `notify::Event` into raw changes
///
/// - `Create(*)` and `Modify(Name(To))` become `Created`
/// - `Remove(*)` and `Modify(Name(From))` become `Removed`
/// - `Modify(Name(Both))` becomes `Removed(old)` plus `Created(new)`
/// - other `Modify(*)` become `Modified`, except access-time updates
/// - access events are ignored
pub fn map_notify_event(event: &notify::Event) -> Vec<RawChange> {
    let paths = &event.paths;
    let Some(first) = paths.first() else {
        return Vec::new();
    };

    let dir_hint = match event.kind {
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => {
            Some(true)
        }
        EventKind::Create(CreateKind::File) | EventKind::Remove(RemoveKind::File) => Some(false),
        _ => None,
    };

    let changes = match &event.kind {
        EventKind::Create(_) => vec![RawChange::new(RawKind::Created, first)],
        EventKind::Remove(_) => vec![RawChange::new(RawKind::Removed, first)],
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            vec![RawChange::new(RawKind::Removed, first)]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            vec![RawChange::new(RawKind::Created, first)]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => vec![
            RawChange::new(RawKind::Removed, first),
            RawChange::new(RawKind::Created, &paths[1]),
        ],
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)) => Vec::new(),
        EventKind::Modify(_) => vec![RawChange::new(RawKind::Modified, first)],
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    };

    changes
        .into_iter()
        .map(|c| c.with_dir_hint(dir_hint))
        .collect()
}

// ============================================================================
// Debouncer
// ============================================================================

/// Net effect of a settled window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetChange {
    /// The path did not exist before the window
    Appeared,
    /// The path existed before and after the window
    Changed,
    /// The path existed before the window and is gone
    Vanished,
}

impl NetChange {
    fn between(first: RawKind, last: RawKind) -> Option<Self> {
        match (first, last) {
            (RawKind::Created, RawKind::Removed) => None,
            (RawKind::Created, _) => Some(NetChange::Appeared),
            (_, RawKind::Removed) => Some(NetChange::Vanished),
            _ => Some(NetChange::Changed),
        }
    }
}

/// A path whose window closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settled {
    pub path: PathBuf,
    pub change: NetChange,
    pub is_dir: Option<bool>,
}

#[derive(Debug)]
struct Pending {
    first: RawKind,
    last: RawKind,
    last_seen: Instant,
    is_dir: Option<bool>,
}

/// Coalesces raw changes per path over a sliding window
///
/// Every new raw change for a path restarts that path's window; other
/// paths are unaffected. Time is passed in explicitly so the behavior is
/// deterministic under test.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: HashMap<PathBuf, Pending>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records `change` as seen at `now`
    pub fn push_at(&mut self, change: RawChange, now: Instant) {
        trace!(path = %change.path.display(), kind = ?change.kind, "Raw change");
        self.pending
            .entry(change.path)
            .and_modify(|p| {
                p.last = change.kind;
                p.last_seen = now;
                if change.is_dir.is_some() {
                    p.is_dir = change.is_dir;
                }
            })
            .or_insert(Pending {
                first: change.kind,
                last: change.kind,
                last_seen: now,
                is_dir: change.is_dir,
            });
    }

    /// Removes and returns every path that has been quiet for a full window
    ///
    /// Paths whose changes cancel out are dropped without a result.
    pub fn poll_at(&mut self, now: Instant) -> Vec<Settled> {
        let ready: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) >= self.window)
            .map(|(path, _)| path.clone())
            .collect();

        let mut settled = Vec::with_capacity(ready.len());
        for path in ready {
            let Some(p) = self.pending.remove(&path) else {
                continue;
            };
            match NetChange::between(p.first, p.last) {
                Some(change) => settled.push(Settled {
                    path,
                    change,
                    is_dir: p.is_dir,
                }),
                None => debug!(path = %path.display(), "Changes cancelled out inside the window"),
            }
        }
        settled.sort_by(|a, b| a.path.cmp(&b.path));
        settled
    }

    /// Earliest instant at which some pending path settles
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.last_seen + self.window)
            .min()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

// ============================================================================
// Classification and echo suppression
// ============================================================================

/// Turns settled windows into [`WatchEvent`]s, dropping the engine's echoes
struct Classifier {
    root: SyncPath,
    write_log: Arc<WriteLog>,
    known_dirs: HashSet<PathBuf>,
}

impl Classifier {
    fn new(root: SyncPath, write_log: Arc<WriteLog>, known_dirs: HashSet<PathBuf>) -> Self {
        Self {
            root,
            write_log,
            known_dirs,
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        path != self.root.as_path() && path.starts_with(self.root.as_path()) && !is_partial_path(path)
    }

    async fn classify(&mut self, settled: Settled) -> Option<WatchEvent> {
        let path = SyncPath::new_within_root(settled.path.clone(), &self.root).ok()?;

        let stat = match settled.change {
            NetChange::Vanished => None,
            NetChange::Appeared | NetChange::Changed => match local::stat(path.as_path()).await {
                Ok(stat) => stat,
                Err(e) => {
                    warn!(path = %path, error = %e, "Cannot stat changed path");
                    return None;
                }
            },
        };

        let kind = match (settled.change, stat) {
            (NetChange::Appeared, None) => return None,
            (NetChange::Changed, None) | (NetChange::Vanished, _) => {
                let was_dir =
                    self.known_dirs.contains(path.as_path()) || settled.is_dir == Some(true);
                self.forget_dirs(path.as_path());
                if was_dir {
                    WatchEventKind::UnlinkDir
                } else {
                    WatchEventKind::Unlink
                }
            }
            (NetChange::Appeared, Some(s)) | (NetChange::Changed, Some(s)) if s.is_dir => {
                if !self.known_dirs.insert(path.as_path().to_path_buf())
                    && settled.change == NetChange::Changed
                {
                    // directory metadata changes carry no content
                    return None;
                }
                WatchEventKind::AddDir
            }
            (NetChange::Appeared, Some(_)) => WatchEventKind::Add,
            (NetChange::Changed, Some(_)) => WatchEventKind::Change,
        };

        if self.is_echo(kind, &path).await {
            debug!(path = %path, kind = %kind, "Suppressed echo of engine write");
            return None;
        }

        Some(WatchEvent { kind, path, stat })
    }

    fn forget_dirs(&mut self, path: &Path) {
        self.known_dirs.retain(|d| !d.starts_with(path));
    }

    async fn is_echo(&self, kind: WatchEventKind, path: &SyncPath) -> bool {
        let path = path.as_path();
        match kind {
            WatchEventKind::AddDir => self.write_log.is_echo(path, &Fingerprint::Directory),
            WatchEventKind::Unlink | WatchEventKind::UnlinkDir => {
                self.write_log.is_echo(path, &Fingerprint::Removed)
            }
            WatchEventKind::Add | WatchEventKind::Change => {
                // only hash files the engine wrote recently
                if !self.write_log.has_recent(path) {
                    return false;
                }
                match local::hash_file(path).await {
                    Ok(hash) => self.write_log.is_echo(path, &Fingerprint::Content(hash)),
                    Err(e) => {
                        debug!(path = %path.display(), error = %e, "Cannot hash for echo check");
                        false
                    }
                }
            }
        }
    }
}

/// Every directory under `root`, excluding `root` itself
fn scan_directories(root: &Path) -> HashSet<PathBuf> {
    let mut found = HashSet::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                let path = entry.path();
                stack.push(path.clone());
                found.insert(path);
            }
        }
    }
    found
}

// ============================================================================
// FileWatcher
// ============================================================================

/// Creates watch streams over a sync root
///
/// ## Usage
///
/// ```ignore
/// let watcher = FileWatcher::new(&config.watcher, machine.write_log().clone());
/// let mut stream = watcher.watch(machine.root())?;
/// while let Some(event) = stream.next().await {
///     orchestrator.submit_local_event(event?).await;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct FileWatcher {
    debounce: Duration,
    write_log: Arc<WriteLog>,
}

impl FileWatcher {
    pub fn new(config: &WatcherConfig, write_log: Arc<WriteLog>) -> Self {
        Self::with_debounce(config.debounce(), write_log)
    }

    pub fn with_debounce(debounce: Duration, write_log: Arc<WriteLog>) -> Self {
        Self {
            debounce,
            write_log,
        }
    }

    /// Starts a recursive watch of `root`
    ///
    /// Must be called inside a Tokio runtime. The returned stream is not
    /// restartable: once stopped or failed, call `watch` again.
    ///
    /// # Errors
    ///
    /// Returns a [`WatcherError`] if the OS watcher cannot be created or
    /// the root cannot be watched (missing, no permission, watch limit).
    pub fn watch(&self, root: &SyncPath) -> Result<WatchStream, WatcherError> {
        info!(root = %root, debounce_ms = self.debounce.as_millis() as u64, "Starting recursive watch");

        let (raw_tx, raw_rx) = mpsc::channel::<notify::Result<notify::Event>>(CHANNEL_CAPACITY);
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if raw_tx.blocking_send(res).is_err() {
                    trace!("Watch stream gone, dropping notification");
                }
            },
            notify::Config::default(),
        )
        .map_err(|e| WatcherError::from_notify(root.as_path(), e))?;

        watcher
            .watch(root.as_path(), RecursiveMode::Recursive)
            .map_err(|e| WatcherError::from_notify(root.as_path(), e))?;

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let stop = CancellationToken::new();
        let classifier = Classifier::new(
            root.clone(),
            Arc::clone(&self.write_log),
            scan_directories(root.as_path()),
        );
        let task = tokio::spawn(run_watch_loop(
            watcher,
            raw_rx,
            out_tx,
            Debouncer::new(self.debounce),
            classifier,
            stop.clone(),
        ));

        Ok(WatchStream {
            events: out_rx,
            stop,
            task: Some(task),
            stopped: false,
        })
    }
}

async fn run_watch_loop(
    watcher: RecommendedWatcher,
    mut raw_rx: mpsc::Receiver<notify::Result<notify::Event>>,
    out_tx: mpsc::Sender<Result<WatchEvent, WatcherError>>,
    mut debouncer: Debouncer,
    mut classifier: Classifier,
    stop: CancellationToken,
) {
    let root = classifier.root.clone();

    'run: loop {
        let deadline = debouncer.next_deadline();
        let wake = tokio::time::Instant::from_std(
            deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
        );

        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            // settle before reading more raw events
            _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                for settled in debouncer.poll_at(Instant::now()) {
                    if let Some(event) = classifier.classify(settled).await {
                        debug!(path = %event.path, kind = %event.kind, "Local change");
                        if out_tx.send(Ok(event)).await.is_err() {
                            break 'run;
                        }
                    }
                }
            }
            raw = raw_rx.recv() => match raw {
                Some(Ok(event)) => {
                    let now = Instant::now();
                    for change in map_notify_event(&event) {
                        if classifier.accepts(&change.path) {
                            debouncer.push_at(change, now);
                        }
                    }
                }
                Some(Err(e)) => {
                    let err = WatcherError::from_notify(root.as_path(), e);
                    error!(root = %root, error = %err, "File watcher failed");
                    if out_tx.send(Err(err)).await.is_err() {
                        debug!("Watch stream dropped before the failure was delivered");
                    }
                    break;
                }
                None => {
                    error!(root = %root, "OS notification channel closed");
                    if out_tx.send(Err(WatcherError::Closed)).await.is_err() {
                        debug!("Watch stream dropped before the failure was delivered");
                    }
                    break;
                }
            },
        }
    }

    drop(watcher);
    info!(root = %root, "File watcher stopped");
}

// ============================================================================
// WatchStream
// ============================================================================

/// Stops a [`WatchStream`] from another task
#[derive(Debug, Clone)]
pub struct WatchStopHandle(CancellationToken);

impl WatchStopHandle {
    /// Idempotent
    pub fn stop(&self) {
        self.0.cancel();
    }
}

/// Lazy, non-restartable sequence of local changes
///
/// Yields `Ok(WatchEvent)` until stopped. A watcher failure is yielded once
/// as `Err` and ends the stream. Dropping the stream stops the watch.
#[derive(Debug)]
pub struct WatchStream {
    events: mpsc::Receiver<Result<WatchEvent, WatcherError>>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
    stopped: bool,
}

impl WatchStream {
    /// Next event, `None` once the stream has ended
    pub async fn next(&mut self) -> Option<Result<WatchEvent, WatcherError>> {
        if self.stopped {
            return None;
        }
        self.events.recv().await
    }

    /// Ends the stream and releases the OS watch; idempotent
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.stop.cancel();
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn stop_handle(&self) -> WatchStopHandle {
        WatchStopHandle(self.stop.clone())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped || self.stop.is_cancelled()
    }
}

impl Stream for WatchStream {
    type Item = Result<WatchEvent, WatcherError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.stopped {
            return Poll::Ready(None);
        }
        self.events.poll_recv(cx)
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Unit tests
// ============================================================================

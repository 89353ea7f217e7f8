//! Operation queue
//!
//! FIFO of [`SyncOperation`]s with one lane per path. At most one operation
//! per path is handed out at a time; operations for different paths are
//! handed out in arrival order and may run concurrently.
//!
//! A newly pushed operation is merged into the last queued operation of
//! its lane when both come from the same source and the pair reduces to a
//! single operation (`Add` then `Change` is still an `Add`, `Add` then
//! `Unlink` is an `Unlink`, and so on). Operations already handed to a
//! worker are never merged into.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use nimbus_core::domain::{OperationKind, Status, SyncOperation, SyncPath};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, trace};

use crate::SyncError;

/// Kind produced by queuing `next` right after `prev`, when the two reduce
/// to one operation
pub fn merged_kind(prev: OperationKind, next: OperationKind) -> Option<OperationKind> {
    use OperationKind::*;

    match (prev, next) {
        (Add, Change) | (Add, Add) => Some(Add),
        (Change, Change) => Some(Change),
        (Add, Unlink) | (Change, Unlink) | (Unlink, Unlink) => Some(Unlink),
        (Unlink, Add) | (Unlink, Change) => Some(Change),
        (AddDir, AddDir) => Some(AddDir),
        (AddDir, UnlinkDir) | (UnlinkDir, UnlinkDir) => Some(UnlinkDir),
        (Hydrate, Hydrate) => Some(Hydrate),
        (Dehydrate, Dehydrate) => Some(Dehydrate),
        (Pin, Pin) | (Unpin, Pin) => Some(Pin),
        (Unpin, Unpin) | (Pin, Unpin) => Some(Unpin),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct QueueState {
    lanes: HashMap<SyncPath, VecDeque<SyncOperation>>,
    /// Paths with queued work that no worker holds, oldest first
    ready: VecDeque<SyncPath>,
    /// Paths handed to a worker or waiting for a retry
    held: HashSet<SyncPath>,
    closed: bool,
}

impl QueueState {
    fn queued(&self) -> usize {
        self.lanes.values().map(VecDeque::len).sum()
    }

    fn is_idle(&self) -> bool {
        self.lanes.is_empty() && self.held.is_empty()
    }

    fn take_ready(&mut self) -> Option<SyncOperation> {
        while let Some(path) = self.ready.pop_front() {
            let Some(lane) = self.lanes.get_mut(&path) else {
                continue;
            };
            let Some(mut op) = lane.pop_front() else {
                self.lanes.remove(&path);
                continue;
            };
            if lane.is_empty() {
                self.lanes.remove(&path);
            }
            self.held.insert(path);
            op.status = Status::InProgress;
            return Some(op);
        }
        None
    }

    /// Releases `path` and schedules its lane if more work is queued
    fn release(&mut self, path: &SyncPath) -> bool {
        self.held.remove(path);
        if self.lanes.contains_key(path) {
            self.ready.push_back(path.clone());
            true
        } else {
            false
        }
    }
}

/// Per-path serialized FIFO shared by the orchestrator's workers
#[derive(Debug, Default)]
pub struct OperationQueue {
    state: Mutex<QueueState>,
    work: Notify,
    idle: Notify,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `op`, merging it into the lane's last queued operation when
    /// possible
    ///
    /// # Errors
    ///
    /// Returns `SyncError::QueueClosed` after [`close`](Self::close).
    pub async fn push(&self, mut op: SyncOperation) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SyncError::QueueClosed);
        }

        op.status = Status::Queued;
        let path = op.path.clone();
        let held = state.held.contains(&path);
        let lane = state.lanes.entry(path.clone()).or_default();
        let was_empty = lane.is_empty();

        if let Some(prev) = lane.back_mut() {
            if prev.source == op.source && prev.origin.is_none() && op.origin.is_none() {
                if let Some(kind) = merged_kind(prev.kind, op.kind) {
                    debug!(path = %path, from = %prev.kind, with = %op.kind, into = %kind, "Coalesced queued operation");
                    prev.kind = kind;
                    if op.remote.is_some() {
                        prev.remote = op.remote;
                    }
                    return Ok(());
                }
            }
        }

        trace!(path = %path, kind = %op.kind, source = %op.source, "Operation queued");
        lane.push_back(op);
        if was_empty && !held {
            state.ready.push_back(path);
            drop(state);
            self.work.notify_one();
        }
        Ok(())
    }

    /// Waits for the next runnable operation
    ///
    /// Returns `None` once the queue is closed. The path of the returned
    /// operation stays held until [`complete`](Self::complete) or
    /// [`retry_later`](Self::retry_later) is called for it.
    pub async fn next(&self) -> Option<SyncOperation> {
        loop {
            let notified = self.work.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                if let Some(op) = state.take_ready() {
                    // more work may be ready for another worker
                    if !state.ready.is_empty() {
                        self.work.notify_one();
                    }
                    return Some(op);
                }
            }

            notified.await;
        }
    }

    /// Marks the operation held for `path` as finished
    pub async fn complete(&self, path: &SyncPath) {
        let mut state = self.state.lock().await;
        let more = state.release(path);
        let idle = state.is_idle();
        drop(state);

        if more {
            self.work.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Puts `op` back at the front of its lane after `delay`
    ///
    /// The path stays held while waiting, so nothing queued behind the
    /// failed operation overtakes it.
    pub fn retry_later(self: &Arc<Self>, op: SyncOperation, delay: Duration) {
        let queue = Arc::clone(self);
        debug!(path = %op.path, kind = %op.kind, attempt = op.retry_count, delay_ms = delay.as_millis() as u64, "Retry scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = queue.state.lock().await;
            let path = op.path.clone();
            if state.closed {
                state.held.remove(&path);
                return;
            }
            let mut op = op;
            op.status = Status::Queued;
            state.lanes.entry(path.clone()).or_default().push_front(op);
            state.release(&path);
            drop(state);
            queue.work.notify_one();
        });
    }

    /// Stops handing out operations; queued work is dropped
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        let dropped = state.queued();
        state.lanes.clear();
        state.ready.clear();
        drop(state);

        info!(dropped, "Operation queue closed");
        self.work.notify_waiters();
        self.idle.notify_waiters();
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Number of queued operations, excluding held ones
    pub async fn len(&self) -> usize {
        self.state.lock().await.queued()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of paths currently held by workers or waiting retries
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.held.len()
    }

    /// Returns true when nothing is queued or held
    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.is_idle()
    }

    /// Resolves once nothing is queued or held, or the queue is closed
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock().await;
                if state.is_idle() || state.closed {
                    return;
                }
            }

            notified.await;
        }
    }
}

//! Shared harness for sync integration tests

use std::{fs::File, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use nimbus_cache::MemoryMetadataStore;
use nimbus_conflict::ConflictNamer;
use nimbus_core::{
    classify::ErrorReporter,
    domain::{OperationKind, RemoteItem, SyncPath},
};
use nimbus_placeholder::{InMemoryDriver, PlaceholderStateMachine};
use nimbus_sync::{
    Backoff, OperationReport, OrchestratorSettings, RemoteEvent, SyncOrchestrator, WatchEvent,
    WatchEventKind,
};
use nimbus_transfer::{MemoryRemote, TransferLimiter, TransferPipeline, WriteLog};
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const MAX_ATTEMPTS: u32 = 3;

pub struct Harness {
    pub dir: TempDir,
    pub root: SyncPath,
    pub remote: Arc<MemoryRemote>,
    pub driver: Arc<InMemoryDriver>,
    pub machine: Arc<PlaceholderStateMachine>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl Harness {
    /// Machine, orchestrator and two workers over a fresh temporary root
    pub async fn new() -> Self {
        Self::with_call_timeout(Duration::from_secs(5)).await
    }

    /// Same as [`Harness::new`] with a custom deadline for remote calls
    pub async fn with_call_timeout(call_timeout: Duration) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = SyncPath::new(dir.path().to_path_buf()).unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let driver = Arc::new(InMemoryDriver::new());
        let pipeline = Arc::new(TransferPipeline::with_settings(
            remote.clone(),
            Arc::new(TransferLimiter::new(4, Duration::ZERO)),
            Arc::new(WriteLog::default()),
            64 * 1024,
            call_timeout,
        ));
        let machine = Arc::new(PlaceholderStateMachine::new(
            root.clone(),
            driver.clone(),
            Arc::new(MemoryMetadataStore::new()),
            pipeline,
            ErrorReporter::new(),
        ));
        machine.load().await.unwrap();

        let settings = OrchestratorSettings {
            workers: 2,
            backoff: Backoff::new(
                Duration::from_millis(1),
                Duration::from_millis(5),
                MAX_ATTEMPTS,
                false,
            ),
            namer: ConflictNamer::default(),
            call_timeout,
        };
        let orchestrator = Arc::new(SyncOrchestrator::new(machine.clone(), settings));
        orchestrator.start().await;

        Self {
            dir,
            root,
            remote,
            driver,
            machine,
            orchestrator,
        }
    }

    /// Absolute path of `rel` inside the sync root
    pub fn path(&self, rel: &str) -> SyncPath {
        SyncPath::new(self.dir.path().join(rel)).unwrap()
    }

    pub fn read(&self, path: &SyncPath) -> Vec<u8> {
        std::fs::read(path.as_path()).unwrap()
    }

    /// Writes `content` at `rel` with the given modification time
    pub fn write_local(&self, rel: &str, content: &[u8], modified: DateTime<Utc>) -> SyncPath {
        let path = self.path(rel);
        if let Some(parent) = path.as_path().parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path.as_path(), content).unwrap();
        File::options()
            .write(true)
            .open(path.as_path())
            .unwrap()
            .set_modified(modified.into())
            .unwrap();
        path
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationReport> {
        self.orchestrator.subscribe()
    }

    /// Submits a local watcher event and waits for the queue to drain
    pub async fn local(&self, kind: WatchEventKind, path: &SyncPath) {
        self.orchestrator
            .submit_local_event(WatchEvent {
                kind,
                path: path.clone(),
                stat: None,
            })
            .await
            .unwrap();
        self.settle().await;
    }

    /// Submits a remote event and waits for the queue to drain
    pub async fn remote_event(&self, kind: OperationKind, path: &SyncPath, item: Option<RemoteItem>) {
        self.orchestrator
            .submit_remote_event(RemoteEvent::new(kind, path.clone(), item))
            .await
            .unwrap();
        self.settle().await;
    }

    /// Submits a user action and waits for the queue to drain
    pub async fn user(&self, kind: OperationKind, path: &SyncPath) {
        self.orchestrator
            .submit_user_action(kind, path.clone())
            .await
            .unwrap();
        self.settle().await;
    }

    /// Stores `content` at the remote root and syncs it down as a placeholder
    pub async fn seed_remote(&self, name: &str, content: &[u8], modified: DateTime<Utc>) -> (SyncPath, RemoteItem) {
        let item = self.remote.insert_file(None, name, content, modified).unwrap();
        let path = self.path(name);
        self.remote_event(OperationKind::Add, &path, Some(item.clone())).await;
        (path, item)
    }

    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.orchestrator.wait_idle())
            .await
            .expect("queue did not drain in time");
    }
}

/// Next report for `path`, skipping reports for other paths
pub async fn report_for(rx: &mut broadcast::Receiver<OperationReport>, path: &SyncPath) -> OperationReport {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let report = rx.recv().await.unwrap();
            if &report.operation.path == path {
                return report;
            }
        }
    })
    .await
    .expect("no report in time")
}

/// Polls `condition` until it holds or `limit` elapses
pub async fn wait_for(limit: Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

//! Shared harness for placeholder integration tests

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use nimbus_cache::MemoryMetadataStore;
use nimbus_core::{
    classify::ErrorReporter,
    domain::{RemoteItem, SyncPath},
};
use nimbus_placeholder::{InMemoryDriver, PlaceholderStateMachine, Registration};
use nimbus_transfer::{MemoryRemote, TransferLimiter, TransferPipeline, WriteLog};
use tempfile::TempDir;

pub struct Harness {
    pub dir: TempDir,
    pub root: SyncPath,
    pub remote: Arc<MemoryRemote>,
    pub driver: Arc<InMemoryDriver>,
    pub store: Arc<MemoryMetadataStore>,
    pub machine: Arc<PlaceholderStateMachine>,
}

/// A fresh temporary sync root
pub fn temp_root() -> (TempDir, SyncPath) {
    let dir = tempfile::tempdir().unwrap();
    let root = SyncPath::new(dir.path().to_path_buf()).unwrap();
    (dir, root)
}

impl Harness {
    pub async fn new() -> Self {
        let (dir, _) = temp_root();
        Self::with_store(dir, MemoryMetadataStore::new()).await
    }

    /// Builds a machine over `dir` and loads whatever `store` holds
    pub async fn with_store(dir: TempDir, store: MemoryMetadataStore) -> Self {
        let root = SyncPath::new(dir.path().to_path_buf()).unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let driver = Arc::new(InMemoryDriver::new());
        let store = Arc::new(store);
        let pipeline = Arc::new(TransferPipeline::with_settings(
            remote.clone(),
            Arc::new(TransferLimiter::new(4, Duration::ZERO)),
            Arc::new(WriteLog::default()),
            64 * 1024,
            Duration::from_secs(5),
        ));
        let machine = Arc::new(PlaceholderStateMachine::new(
            root.clone(),
            driver.clone(),
            store.clone(),
            pipeline,
            ErrorReporter::new(),
        ));
        machine.load().await.unwrap();

        Self {
            dir,
            root,
            remote,
            driver,
            store,
            machine,
        }
    }

    /// Absolute path of `rel` inside the sync root
    pub fn path(&self, rel: &str) -> SyncPath {
        SyncPath::new(self.dir.path().join(rel)).unwrap()
    }

    /// Stores `content` on the remote and registers a placeholder for it
    pub async fn seed_file(&self, rel: &str, content: &[u8]) -> (SyncPath, RemoteItem) {
        let path = self.path(rel);
        let name = path.file_name().unwrap().to_string();
        let item = self
            .remote
            .insert_file(None, &name, content, Utc::now())
            .unwrap();
        self.machine
            .register_placeholder(&path, Registration::from_remote(&item))
            .await
            .unwrap();
        (path, item)
    }

    /// Bytes currently on disk at `path`
    pub fn read(&self, path: &SyncPath) -> Vec<u8> {
        std::fs::read(path.as_path()).unwrap()
    }
}

/// Polls `condition` until it holds, failing after two seconds
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

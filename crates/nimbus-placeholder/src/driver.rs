//! In-memory native driver.
//!
//! Records every command the state machine issues and keeps a view of the
//! placeholders it would have created. Used wherever the OS layer is not
//! wanted: unit tests, orchestrator scenarios and dry runs of the daemon.

use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use nimbus_core::{
    domain::{EntryState, PlaceholderEntry, SyncPath},
    ports::NativeDriver,
};

/// A command received by [`InMemoryDriver`]
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCommand {
    Create {
        path: SyncPath,
        state: EntryState,
    },
    Update {
        path: SyncPath,
        state: EntryState,
        pinned: bool,
    },
    Delete {
        path: SyncPath,
    },
    Progress {
        path: SyncPath,
        fraction: f64,
    },
}

impl DriverCommand {
    /// Path the command acts on
    pub fn path(&self) -> &SyncPath {
        match self {
            DriverCommand::Create { path, .. }
            | DriverCommand::Update { path, .. }
            | DriverCommand::Delete { path }
            | DriverCommand::Progress { path, .. } => path,
        }
    }
}

/// Native driver that keeps everything in memory
#[derive(Debug, Default)]
pub struct InMemoryDriver {
    placeholders: DashMap<SyncPath, PlaceholderEntry>,
    commands: Mutex<Vec<DriverCommand>>,
    failure: Mutex<Option<String>>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next command fail with `message`
    pub fn fail_next(&self, message: impl Into<String>) {
        *lock(&self.failure) = Some(message.into());
    }

    /// Every command received so far, oldest first
    pub fn commands(&self) -> Vec<DriverCommand> {
        lock(&self.commands).clone()
    }

    /// Progress fractions reported for `path`
    pub fn progress(&self, path: &SyncPath) -> Vec<f64> {
        lock(&self.commands)
            .iter()
            .filter_map(|c| match c {
                DriverCommand::Progress { path: p, fraction } if p == path => Some(*fraction),
                _ => None,
            })
            .collect()
    }

    /// Last entry pushed to the native layer for `path`
    pub fn placeholder(&self, path: &SyncPath) -> Option<PlaceholderEntry> {
        self.placeholders.get(path).map(|e| e.clone())
    }

    /// Returns true if a placeholder exists at `path`
    pub fn contains(&self, path: &SyncPath) -> bool {
        self.placeholders.contains_key(path)
    }

    /// Number of placeholders currently held
    pub fn len(&self) -> usize {
        self.placeholders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placeholders.is_empty()
    }

    fn push(&self, command: DriverCommand) -> anyhow::Result<()> {
        if let Some(message) = lock(&self.failure).take() {
            anyhow::bail!("{message}");
        }
        lock(&self.commands).push(command);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait::async_trait]
impl NativeDriver for InMemoryDriver {
    async fn create_placeholder(&self, entry: &PlaceholderEntry) -> anyhow::Result<()> {
        self.push(DriverCommand::Create {
            path: entry.path().clone(),
            state: entry.state(),
        })?;
        self.placeholders.insert(entry.path().clone(), entry.clone());
        Ok(())
    }

    async fn update_placeholder(&self, entry: &PlaceholderEntry) -> anyhow::Result<()> {
        self.push(DriverCommand::Update {
            path: entry.path().clone(),
            state: entry.state(),
            pinned: entry.is_pinned(),
        })?;
        self.placeholders.insert(entry.path().clone(), entry.clone());
        Ok(())
    }

    async fn delete_placeholder(&self, path: &SyncPath) -> anyhow::Result<()> {
        self.push(DriverCommand::Delete { path: path.clone() })?;
        self.placeholders.retain(|p, _| !p.is_within(path));
        Ok(())
    }

    async fn report_progress(&self, path: &SyncPath, fraction: f64) -> anyhow::Result<()> {
        self.push(DriverCommand::Progress {
            path: path.clone(),
            fraction,
        })
    }
}

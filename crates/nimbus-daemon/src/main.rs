//! Nimbus Daemon - Background synchronization service
//!
//! `nimbusd` runs as a user service and wires the engine together:
//! - Restores placeholder metadata from SQLite
//! - Watches the sync root and feeds local changes to the orchestrator
//! - Bridges native driver callbacks (hydrate, dehydrate, rename, delete)
//! - Scans the remote tree periodically
//! - Sweeps hydrated files when the cache grows past its limit
//! - Shuts down gracefully on SIGTERM/SIGINT
//!
//! # Architecture
//!
//! Every long-running task receives a child of one `CancellationToken`.
//! The token is cancelled by a signal or by a fatal watcher error; the
//! daemon then stops the orchestrator, cancels running transfers and
//! closes the database.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nimbus_cache::{DatabasePool, MemoryMetadataStore, SqliteMetadataStore};
use nimbus_core::{
    classify::ErrorReporter,
    config::Config,
    domain::SyncPath,
    ports::{
        DriverEvent, LogNotifier, MetadataStore, NativeDriver, RemoteStorage, StaticToken,
    },
};
use nimbus_placeholder::{PlaceholderStateMachine, ReclaimManager, ReclaimPolicy};
use nimbus_sync::{FileWatcher, OrchestratorSettings, RemoteScanner, SyncOrchestrator};
use nimbus_transfer::{HttpRemoteStorage, MemoryRemote, TransferLimiter, TransferPipeline, WriteLog};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Environment variable read for the bearer token when the configuration
/// names none
const DEFAULT_TOKEN_ENV: &str = "NIMBUS_TOKEN";

/// Capacity of the driver callback and forwarded operation channels
const BRIDGE_CAPACITY: usize = 256;

#[derive(Debug, Parser)]
#[command(name = "nimbusd", version, about = "Nimbus virtual filesystem sync daemon")]
struct Cli {
    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the sync root from the configuration
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the sync engine until SIGINT/SIGTERM (default)
    Run {
        /// Keep placeholder metadata in memory instead of SQLite
        #[arg(long)]
        ephemeral: bool,
    },
    /// Validate the configuration and exit
    CheckConfig,
}

// ============================================================================
// Backends
// ============================================================================

/// Adapters plugged into the engine's ports
struct Backends {
    remote: Arc<dyn RemoteStorage>,
    store: Arc<dyn MetadataStore>,
    driver: Arc<dyn NativeDriver>,
    /// Open when metadata lives in SQLite
    pool: Option<DatabasePool>,
}

impl Backends {
    /// Builds the adapters named by `config`
    ///
    /// Without a configured remote the daemon runs against an in-memory
    /// remote, which keeps the local side working offline.
    async fn from_config(config: &Config, ephemeral: bool) -> Result<Self> {
        let (store, pool): (Arc<dyn MetadataStore>, _) = if ephemeral {
            info!("Placeholder metadata kept in memory");
            (Arc::new(MemoryMetadataStore::new()), None)
        } else {
            let pool = DatabasePool::new(&config.sync.database)
                .await
                .context("Failed to open database")?;
            info!(database = %config.sync.database.display(), "Opened metadata database");
            (Arc::new(SqliteMetadataStore::new(pool.pool().clone())), Some(pool))
        };

        let remote: Arc<dyn RemoteStorage> = match &config.remote.base_url {
            Some(base_url) => {
                let var = config
                    .remote
                    .token_env
                    .as_deref()
                    .unwrap_or(DEFAULT_TOKEN_ENV);
                let token = std::env::var(var)
                    .with_context(|| format!("Remote access token not found in ${var}"))?;
                info!(base_url = %base_url, "Using HTTP remote");
                Arc::new(HttpRemoteStorage::new(
                    base_url.clone(),
                    Arc::new(StaticToken(token)),
                    config.transfer.request_timeout(),
                )?)
            }
            None => {
                warn!("No remote configured, syncing against an in-memory remote");
                Arc::new(MemoryRemote::new())
            }
        };

        Ok(Self {
            remote,
            store,
            driver: native_driver(),
            pool,
        })
    }
}

#[cfg(target_os = "linux")]
fn native_driver() -> Arc<dyn NativeDriver> {
    Arc::new(nimbus_placeholder::XattrDriver::new())
}

#[cfg(not(target_os = "linux"))]
fn native_driver() -> Arc<dyn NativeDriver> {
    warn!("No native placeholder driver for this platform, placeholders exist in metadata only");
    Arc::new(nimbus_placeholder::InMemoryDriver::new())
}

// ============================================================================
// DaemonService
// ============================================================================

/// The running engine and the tasks that feed it
struct DaemonService {
    config: Config,
    root: SyncPath,
    machine: Arc<PlaceholderStateMachine>,
    orchestrator: Arc<SyncOrchestrator>,
    pool: Option<DatabasePool>,
    /// Entry point for native driver callbacks
    ///
    /// The xattr driver only receives commands and raises no callbacks of
    /// its own. A native layer that does (a kernel shim, a file manager
    /// extension) pushes hydrate, dehydrate, rename and delete requests
    /// through a clone of this sender; the bridge drains them until
    /// shutdown.
    driver_events: mpsc::Sender<DriverEvent>,
    driver_rx: mpsc::Receiver<DriverEvent>,
    shutdown: CancellationToken,
}

impl DaemonService {
    /// Creates the engine over `backends` and restores persisted metadata
    async fn new(config: Config, backends: Backends, shutdown: CancellationToken) -> Result<Self> {
        tokio::fs::create_dir_all(&config.sync.root)
            .await
            .with_context(|| format!("Failed to create sync root {}", config.sync.root.display()))?;
        let root = SyncPath::new(config.sync.root.clone()).context("Invalid sync root")?;

        let write_log = Arc::new(WriteLog::new(config.watcher.echo_ttl()));
        let pipeline = Arc::new(TransferPipeline::new(
            backends.remote,
            Arc::new(TransferLimiter::from_config(&config.transfer)),
            write_log,
            &config.transfer,
        ));
        let machine = Arc::new(PlaceholderStateMachine::new(
            root.clone(),
            backends.driver,
            backends.store,
            pipeline,
            ErrorReporter::with_notifier(Arc::new(LogNotifier)),
        ));
        let restored = machine
            .load()
            .await
            .context("Failed to restore placeholder metadata")?;
        info!(root = %root, entries = restored, "Sync root ready");

        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::clone(&machine),
            OrchestratorSettings::from_config(&config),
        ));

        let (driver_events, driver_rx) = mpsc::channel(BRIDGE_CAPACITY);
        Ok(Self {
            config,
            root,
            machine,
            orchestrator,
            pool: backends.pool,
            driver_events,
            driver_rx,
            shutdown,
        })
    }

    /// Runs the engine until shutdown
    ///
    /// # Errors
    ///
    /// Returns the watcher's error when the sync root can no longer be
    /// watched; sync stops in that case.
    async fn run(self) -> Result<()> {
        let Self {
            config,
            root,
            machine,
            orchestrator,
            pool,
            driver_events,
            driver_rx,
            shutdown,
        } = self;

        let watcher = FileWatcher::new(&config.watcher, Arc::clone(machine.write_log()));
        let stream = watcher
            .watch(&root)
            .context("Failed to watch the sync root")?;
        orchestrator.start().await;

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // local changes; a watcher failure is fatal
        let watcher_task = {
            let orchestrator = Arc::clone(&orchestrator);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let result = orchestrator.run_watcher(stream, shutdown.child_token()).await;
                if result.is_err() {
                    shutdown.cancel();
                }
                result
            })
        };

        // native driver callbacks
        let (ops_tx, ops_rx) = mpsc::channel(BRIDGE_CAPACITY);
        tasks.push(tokio::spawn(Arc::clone(&machine).run_driver_events(
            driver_rx,
            ops_tx,
            shutdown.child_token(),
        )));
        {
            let orchestrator = Arc::clone(&orchestrator);
            let shutdown = shutdown.child_token();
            tasks.push(tokio::spawn(async move {
                orchestrator.forward_operations(ops_rx, shutdown).await;
            }));
        }

        // remote changes
        let scanner = Arc::new(RemoteScanner::new(Arc::clone(&machine)));
        tasks.push(scanner.run_periodic(
            Arc::clone(&orchestrator),
            Duration::from_secs(config.sync.scan_interval_secs),
            shutdown.child_token(),
        ));

        // space reclamation
        let reclaim = Arc::new(ReclaimManager::new(
            ReclaimPolicy::from_config(&config.reclaim),
            Arc::clone(&machine),
        ));
        tasks.push(reclaim.start_periodic(shutdown.child_token()));

        info!(root = %root, "Nimbus daemon running");
        shutdown.cancelled().await;
        info!("Shutting down");
        drop(driver_events);

        orchestrator.shutdown().await;
        machine.shutdown();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        let watcher_result = match watcher_task.await {
            Ok(result) => result.map_err(anyhow::Error::from),
            Err(e) => Err(anyhow::Error::from(e).context("Watcher task panicked")),
        };

        if let Some(pool) = &pool {
            pool.close().await;
        }
        watcher_result.context("Sync stopped because the sync root can no longer be watched")
    }
}

// ============================================================================
// Startup
// ============================================================================

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = if cli.config.is_some() {
        Config::load(&path).with_context(|| format!("Failed to load {}", path.display()))?
    } else {
        Config::load_or_default(&path)
    };
    if let Some(root) = &cli.root {
        config.sync.root = root.clone();
    }
    Ok(config)
}

/// Installs the global subscriber; `RUST_LOG` overrides the configured level
fn init_logging(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}

/// Waits for SIGTERM or SIGINT and cancels `token`
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("Received SIGTERM"),
        _ = token.cancelled() => return,
    }

    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let errors = config.validate();
    if matches!(cli.command, Some(Command::CheckConfig)) {
        if errors.is_empty() {
            println!("Configuration is valid");
            return Ok(());
        }
        for e in &errors {
            eprintln!("{e}");
        }
        bail!("{} configuration error(s)", errors.len());
    }

    init_logging(&config);
    if !errors.is_empty() {
        for e in &errors {
            error!(field = %e.field, "{}", e.message);
        }
        bail!("Invalid configuration");
    }

    let ephemeral = matches!(cli.command, Some(Command::Run { ephemeral: true }));
    info!(root = %config.sync.root.display(), "Nimbus daemon starting (nimbusd)");

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let backends = Backends::from_config(&config, ephemeral).await?;
    let service = DaemonService::new(config, backends, shutdown).await?;
    let result = service.run().await;

    match &result {
        Ok(()) => info!("Nimbus daemon shut down gracefully"),
        Err(e) => error!(error = %format!("{e:#}"), "Nimbus daemon exiting with error"),
    }
    result
}

// ============================================================================
// Tests
// ============================================================================

//! Configuration module for Nimbus.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for Nimbus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub watcher: WatcherConfig,
    pub orchestrator: OrchestratorConfig,
    pub retry: RetryConfig,
    pub transfer: TransferConfig,
    pub reclaim: ReclaimConfig,
    pub conflicts: ConflictsConfig,
    pub remote: RemoteConfig,
    pub logging: LoggingConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root directory managed by the engine.
    pub root: PathBuf,
    /// SQLite file holding placeholder metadata.
    pub database: PathBuf,
    /// Seconds between full remote scans.
    pub scan_interval_secs: u64,
}

/// Local watcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Per-path sliding debounce window in milliseconds.
    pub debounce_ms: u64,
    /// How long an engine write suppresses matching watcher events.
    pub echo_ttl_ms: u64,
}

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Size of the worker pool draining the operation queue.
    pub workers: usize,
}

/// Retry/backoff settings for retryable failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Attempts (including the first) before giving up.
    pub max_attempts: u32,
    /// Randomize each delay within `0..=computed`.
    pub jitter: bool,
}

/// Transfer pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per upload chunk.
    pub chunk_size_bytes: u64,
    /// Maximum transfers in flight across uploads and downloads.
    pub max_concurrent: usize,
    /// Minimum spacing between two transfer starts, in milliseconds.
    pub min_start_spacing_ms: u64,
    /// Deadline for each individual network call, in seconds.
    pub request_timeout_secs: u64,
}

/// Automatic space reclamation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    /// Budget for hydrated content, in bytes.
    pub cache_max_bytes: u64,
    /// Percentage of the budget that triggers a sweep (1-100).
    pub threshold_percent: u8,
    /// Minutes between sweeps.
    pub interval_minutes: u32,
}

/// Conflict handling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictsConfig {
    /// Word placed in parentheses after the losing copy's stem.
    pub suffix: String,
}

/// Remote API settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base URL of the remote storage API. `None` until configured.
    pub base_url: Option<String>,
    /// Environment variable holding the bearer token.
    pub token_env: Option<String>,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Output format: `text` or `json`.
    pub format: String,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Write the configuration as YAML to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/nimbus/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("nimbus")
            .join("config.yaml")
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("nimbus");
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("Nimbus"),
            database: data_dir.join("state.db"),
            scan_interval_secs: 300,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            echo_ttl_ms: 2_000,
        }
    }
}

impl WatcherConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn echo_ttl(&self) -> Duration {
        Duration::from_millis(self.echo_ttl_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { workers: 5 }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 5 * 1024 * 1024,
            max_concurrent: 4,
            min_start_spacing_ms: 50,
            request_timeout_secs: 30,
        }
    }
}

impl TransferConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn min_start_spacing(&self) -> Duration {
        Duration::from_millis(self.min_start_spacing_ms)
    }
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            cache_max_bytes: 10 * 1024 * 1024 * 1024,
            threshold_percent: 80,
            interval_minutes: 60,
        }
    }
}

impl Default for ConflictsConfig {
    fn default() -> Self {
        Self {
            suffix: "conflict".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"retry.max_attempts"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

fn positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        if !self.sync.root.is_absolute() {
            errors.push(ValidationError {
                field: "sync.root".into(),
                message: format!("must be an absolute path: {}", self.sync.root.display()),
            });
        }
        positive(&mut errors, "sync.scan_interval_secs", self.sync.scan_interval_secs);

        // --- watcher ---
        positive(&mut errors, "watcher.debounce_ms", self.watcher.debounce_ms);
        if self.watcher.echo_ttl_ms < self.watcher.debounce_ms {
            errors.push(ValidationError {
                field: "watcher.echo_ttl_ms".into(),
                message: format!(
                    "echo_ttl_ms ({}) must not be shorter than debounce_ms ({})",
                    self.watcher.echo_ttl_ms, self.watcher.debounce_ms
                ),
            });
        }

        // --- orchestrator ---
        if self.orchestrator.workers == 0 || self.orchestrator.workers > 64 {
            errors.push(ValidationError {
                field: "orchestrator.workers".into(),
                message: "must be in range 1..=64".into(),
            });
        }

        // --- retry ---
        positive(&mut errors, "retry.base_delay_ms", self.retry.base_delay_ms);
        positive(&mut errors, "retry.max_attempts", u64::from(self.retry.max_attempts));
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push(ValidationError {
                field: "retry.max_delay_ms".into(),
                message: format!(
                    "max_delay_ms ({}) must not be below base_delay_ms ({})",
                    self.retry.max_delay_ms, self.retry.base_delay_ms
                ),
            });
        }

        // --- transfer ---
        positive(&mut errors, "transfer.chunk_size_bytes", self.transfer.chunk_size_bytes);
        positive(&mut errors, "transfer.max_concurrent", self.transfer.max_concurrent as u64);
        positive(
            &mut errors,
            "transfer.request_timeout_secs",
            self.transfer.request_timeout_secs,
        );

        // --- reclaim ---
        positive(&mut errors, "reclaim.cache_max_bytes", self.reclaim.cache_max_bytes);
        if self.reclaim.threshold_percent == 0 || self.reclaim.threshold_percent > 100 {
            errors.push(ValidationError {
                field: "reclaim.threshold_percent".into(),
                message: "must be in range 1..=100".into(),
            });
        }
        positive(
            &mut errors,
            "reclaim.interval_minutes",
            u64::from(self.reclaim.interval_minutes),
        );

        // --- conflicts ---
        let suffix = self.conflicts.suffix.trim();
        if suffix.is_empty() || suffix.contains('/') || suffix.contains(['(', ')']) {
            errors.push(ValidationError {
                field: "conflicts.suffix".into(),
                message: "must be non-empty and contain no '/', '(' or ')'".into(),
            });
        }

        // --- remote ---
        if let Some(url) = &self.remote.base_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(ValidationError {
                    field: "remote.base_url".into(),
                    message: format!("must be an http(s) URL: {url}"),
                });
            }
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}'; valid options: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use nimbus_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .sync_root(PathBuf::from("/home/user/Nimbus"))
///     .orchestrator_workers(8)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_root(mut self, root: PathBuf) -> Self {
        self.config.sync.root = root;
        self
    }

    pub fn sync_database(mut self, database: PathBuf) -> Self {
        self.config.sync.database = database;
        self
    }

    pub fn sync_scan_interval_secs(mut self, seconds: u64) -> Self {
        self.config.sync.scan_interval_secs = seconds;
        self
    }

    // --- watcher ---

    pub fn watcher_debounce_ms(mut self, ms: u64) -> Self {
        self.config.watcher.debounce_ms = ms;
        self
    }

    pub fn watcher_echo_ttl_ms(mut self, ms: u64) -> Self {
        self.config.watcher.echo_ttl_ms = ms;
        self
    }

    // --- orchestrator ---

    pub fn orchestrator_workers(mut self, workers: usize) -> Self {
        self.config.orchestrator.workers = workers;
        self
    }

    // --- retry ---

    pub fn retry_base_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.base_delay_ms = ms;
        self
    }

    pub fn retry_max_delay_ms(mut self, ms: u64) -> Self {
        self.config.retry.max_delay_ms = ms;
        self
    }

    pub fn retry_max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn retry_jitter(mut self, jitter: bool) -> Self {
        self.config.retry.jitter = jitter;
        self
    }

    // --- transfer ---

    pub fn transfer_chunk_size_bytes(mut self, bytes: u64) -> Self {
        self.config.transfer.chunk_size_bytes = bytes;
        self
    }

    pub fn transfer_max_concurrent(mut self, n: usize) -> Self {
        self.config.transfer.max_concurrent = n;
        self
    }

    pub fn transfer_min_start_spacing_ms(mut self, ms: u64) -> Self {
        self.config.transfer.min_start_spacing_ms = ms;
        self
    }

    pub fn transfer_request_timeout_secs(mut self, seconds: u64) -> Self {
        self.config.transfer.request_timeout_secs = seconds;
        self
    }

    // --- reclaim ---

    pub fn reclaim_cache_max_bytes(mut self, bytes: u64) -> Self {
        self.config.reclaim.cache_max_bytes = bytes;
        self
    }

    pub fn reclaim_threshold_percent(mut self, percent: u8) -> Self {
        self.config.reclaim.threshold_percent = percent;
        self
    }

    pub fn reclaim_interval_minutes(mut self, minutes: u32) -> Self {
        self.config.reclaim.interval_minutes = minutes;
        self
    }

    // --- conflicts ---

    pub fn conflicts_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.config.conflicts.suffix = suffix.into();
        self
    }

    // --- remote ---

    pub fn remote_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.remote.base_url = Some(url.into());
        self
    }

    pub fn remote_token_env(mut self, var: impl Into<String>) -> Self {
        self.config.remote.token_env = Some(var.into());
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

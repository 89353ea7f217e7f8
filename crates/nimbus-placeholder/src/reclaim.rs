//! Space reclamation through file dehydration.
//!
//! Provides `ReclaimManager` for converting hydrated files back to
//! dehydrated placeholders when local content grows past a threshold.
//!
//! ## Reclaim Policy
//!
//! Files are candidates for dehydration when:
//! - State is `Hydrated`
//! - The entry is not pinned
//! - No transfer runs for it
//!
//! Candidates are processed least recently modified first until hydrated
//! usage drops below the threshold.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │   ReclaimManager    │
//! │                     │
//! │  policy             │
//! │  machine: Arc       │
//! └─────────────────────┘
//!           │
//!           │ run_sweep() every N minutes
//!           ▼
//! ┌─────────────────────┐
//! │  1. Sum usage       │ ─── if < threshold, skip
//! │  2. Pick candidates │ ─── hydrated, unpinned, oldest first
//! │  3. For each item:  │
//! │     - dehydrate     │ ─── Hydrated → Dehydrating → Dehydrated
//! │     - stop at goal  │
//! └─────────────────────┘
//! ```

use std::{sync::Arc, time::Duration};

use nimbus_core::{
    config::ReclaimConfig,
    domain::{EntryState, PlaceholderEntry},
};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{error::PlaceholderError, machine::PlaceholderStateMachine};

// ============================================================================
// ReclaimPolicy
// ============================================================================

/// Policy configuration for automatic dehydration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimPolicy {
    /// Maximum bytes of hydrated content.
    pub cache_max_bytes: u64,
    /// Percentage of cache_max_bytes that triggers reclamation (0-100).
    pub threshold_percent: u8,
    /// Interval in minutes between periodic sweeps.
    pub interval_minutes: u32,
}

impl ReclaimPolicy {
    /// Create a policy from the `reclaim` configuration section.
    pub fn from_config(config: &ReclaimConfig) -> Self {
        Self {
            cache_max_bytes: config.cache_max_bytes,
            threshold_percent: config.threshold_percent,
            interval_minutes: config.interval_minutes,
        }
    }

    /// Calculate the threshold in bytes that triggers reclamation.
    pub fn threshold_bytes(&self) -> u64 {
        let percent = u64::from(self.threshold_percent.min(100));
        self.cache_max_bytes / 100 * percent + self.cache_max_bytes % 100 * percent / 100
    }
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self::from_config(&ReclaimConfig::default())
    }
}

// ============================================================================
// ReclaimReport
// ============================================================================

/// Report of a reclamation sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Number of files dehydrated.
    pub dehydrated_count: usize,
    /// Total bytes freed.
    pub bytes_freed: u64,
    /// Number of candidates skipped (pinned, busy, changed locally).
    pub skipped_count: usize,
    /// Number of errors encountered.
    pub error_count: usize,
    /// Error messages for failed items.
    pub errors: Vec<String>,
}

impl ReclaimReport {
    /// Merge another report into this one.
    pub fn merge(&mut self, other: ReclaimReport) {
        self.dehydrated_count += other.dehydrated_count;
        self.bytes_freed += other.bytes_freed;
        self.skipped_count += other.skipped_count;
        self.error_count += other.error_count;
        self.errors.extend(other.errors);
    }
}

/// Bytes of content currently materialized by `entries`.
pub fn hydrated_usage(entries: &[PlaceholderEntry]) -> u64 {
    entries
        .iter()
        .filter(|e| !e.is_directory() && e.state() == EntryState::Hydrated)
        .map(PlaceholderEntry::declared_size)
        .sum()
}

// ============================================================================
// ReclaimManager
// ============================================================================

/// Dehydrates hydrated files when local usage crosses the policy threshold.
pub struct ReclaimManager {
    policy: ReclaimPolicy,
    machine: Arc<PlaceholderStateMachine>,
}

impl ReclaimManager {
    pub fn new(policy: ReclaimPolicy, machine: Arc<PlaceholderStateMachine>) -> Self {
        Self { policy, machine }
    }

    pub fn policy(&self) -> &ReclaimPolicy {
        &self.policy
    }

    /// Run a sweep to reclaim disk space.
    ///
    /// Pinned entries are never touched, whatever the usage.
    pub async fn run_sweep(&self) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        let snapshot = self.machine.snapshot();
        let mut usage = hydrated_usage(&snapshot);
        let threshold = self.policy.threshold_bytes();

        info!(usage_bytes = usage, threshold_bytes = threshold, "Starting reclaim sweep");

        if usage <= threshold {
            debug!("Hydrated usage below threshold, skipping sweep");
            return report;
        }

        let mut candidates: Vec<PlaceholderEntry> = snapshot
            .into_iter()
            .filter(|e| !e.is_directory() && e.state() == EntryState::Hydrated)
            .collect();
        candidates.sort_by_key(|e| e.local_modified());

        for entry in candidates {
            if usage <= threshold {
                break;
            }
            if entry.is_pinned() {
                report.skipped_count += 1;
                continue;
            }

            match self.machine.dehydrate(entry.path()).await {
                Ok(freed) => {
                    report.dehydrated_count += 1;
                    report.bytes_freed += freed;
                    usage = usage.saturating_sub(entry.declared_size());
                }
                Err(PlaceholderError::Domain(e)) => {
                    debug!(path = %entry.path(), reason = %e, "Skipping reclaim candidate");
                    report.skipped_count += 1;
                }
                Err(e) => {
                    warn!(path = %entry.path(), error = %e, "Failed to dehydrate file");
                    report.error_count += 1;
                    report
                        .errors
                        .push(format!("Error dehydrating {}: {}", entry.path(), e));
                }
            }
        }

        info!(
            dehydrated = report.dehydrated_count,
            freed_bytes = report.bytes_freed,
            skipped = report.skipped_count,
            errors = report.error_count,
            "Reclaim sweep complete"
        );
        report
    }

    /// Start periodic sweeps until `shutdown` fires.
    pub fn start_periodic(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(u64::from(self.policy.interval_minutes.max(1)) * 60);

        tokio::spawn(async move {
            let mut interval = time::interval(period);
            // skip the immediate tick
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Periodic reclaim task shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let report = self.run_sweep().await;
                        if report.dehydrated_count > 0 {
                            info!(
                                dehydrated = report.dehydrated_count,
                                freed_bytes = report.bytes_freed,
                                "Periodic sweep freed space"
                            );
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for ReclaimManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReclaimManager")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

//! Global transfer limiter
//!
//! One limiter is shared by every upload and download. It enforces two
//! independent bounds:
//!
//! - **In-flight cap**: at most `max_concurrent` transfers hold a permit
//! - **Start spacing**: two transfer starts are at least `min_spacing` apart
//!
//! Both waits observe the caller's cancellation token, so a cancelled
//! transfer never sits in the limiter queue.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use nimbus_transfer::limiter::TransferLimiter;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let limiter = TransferLimiter::new(4, Duration::from_millis(50));
//! let cancel = CancellationToken::new();
//! let _permit = limiter.acquire(&cancel).await?;
//! // ... transfer bytes while the permit is held ...
//! # Ok(())
//! # }
//! ```

use std::{fmt, sync::Arc, time::Duration};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nimbus_core::{classify::Cancelled, config::TransferConfig};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::TransferError;

/// Held for the duration of one transfer; dropping it frees the slot
#[derive(Debug)]
pub struct TransferPermit {
    _permit: OwnedSemaphorePermit,
}

/// Bounds concurrent transfers and the rate at which they start
pub struct TransferLimiter {
    /// In-flight slots
    slots: Arc<Semaphore>,
    /// Start spacing, absent when spacing is zero
    spacing: Option<DefaultDirectRateLimiter>,
    max_concurrent: usize,
    min_spacing: Duration,
}

impl TransferLimiter {
    /// Creates a limiter
    ///
    /// # Arguments
    /// * `max_concurrent` - Maximum transfers in flight (values below 1 are raised to 1)
    /// * `min_spacing` - Minimum time between two transfer starts; zero disables spacing
    pub fn new(max_concurrent: usize, min_spacing: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let spacing = Quota::with_period(min_spacing).map(RateLimiter::direct);
        Self {
            slots: Arc::new(Semaphore::new(max_concurrent)),
            spacing,
            max_concurrent,
            min_spacing,
        }
    }

    /// Creates a limiter from the `transfer` configuration section
    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(config.max_concurrent, config.min_start_spacing())
    }

    /// Waits for a free slot and for the next start time
    ///
    /// # Errors
    /// Returns [`Cancelled`] if `cancel` fires while waiting, or
    /// [`TransferError::LimiterClosed`] if the limiter was shut down.
    pub async fn acquire(&self, cancel: &CancellationToken) -> anyhow::Result<TransferPermit> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| TransferError::LimiterClosed)?
            }
        };

        if let Some(spacing) = &self.spacing {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled.into()),
                _ = spacing.until_ready() => {}
            }
        }

        trace!(available = self.available(), "Transfer slot acquired");
        Ok(TransferPermit { _permit: permit })
    }

    /// Number of currently free slots
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Configured in-flight cap
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Stops handing out permits; waiting and future callers fail
    pub fn close(&self) {
        self.slots.close();
    }
}

impl fmt::Debug for TransferLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferLimiter")
            .field("max_concurrent", &self.max_concurrent)
            .field("available", &self.available())
            .field("min_spacing", &self.min_spacing)
            .finish()
    }
}

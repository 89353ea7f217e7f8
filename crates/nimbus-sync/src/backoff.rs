//! Retry backoff for failed operations
//!
//! Delays double from the base delay up to the cap. With jitter enabled the
//! delay is drawn uniformly from `0..=computed`.

use std::time::Duration;

use nimbus_core::config::RetryConfig;
use rand::Rng;

/// Exponential backoff with an attempt limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32, jitter: bool) -> Self {
        Self {
            base,
            max: max.max(base),
            max_attempts,
            jitter,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
            config.jitter,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns true if another attempt is allowed after `attempts` attempts,
    /// the first one included
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Upper bound of the delay before retry number `attempt` (1-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let ceiling_ms = ceiling.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms))
    }
}

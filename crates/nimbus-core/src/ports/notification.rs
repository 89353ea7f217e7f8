//! Connectivity notification port (driven/secondary port)
//!
//! The surrounding system (tray, desktop shell, status service) is told
//! when a failure is classified as NETWORK so it can show an offline
//! indicator. Notifications are fire-and-forget.

use crate::classify::ClassifiedError;

/// Receives connectivity-class failures
pub trait ConnectivityNotifier: Send + Sync {
    /// Called once per NETWORK-classified failure
    fn connectivity_issue(&self, error: &ClassifiedError);
}

/// Notifier that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl ConnectivityNotifier for LogNotifier {
    fn connectivity_issue(&self, error: &ClassifiedError) {
        tracing::info!(
            operation = %error.operation,
            attempt = error.attempt,
            "Connectivity issue reported"
        );
    }
}

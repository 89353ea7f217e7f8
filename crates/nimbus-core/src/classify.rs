//! Error classification
//!
//! Every failure raised by a transfer, a remote call or a placeholder
//! operation is mapped onto a fixed taxonomy before it reaches the
//! orchestrator. The taxonomy is checked in precedence order:
//!
//! ```text
//!   ABORTED  >  NETWORK  >  MALFORMED_RESPONSE  >  domain  >  UNKNOWN
//! ```
//!
//! Adapters mark failures by putting one of the marker types below
//! ([`Cancelled`], [`NetworkFailure`], [`MalformedResponse`]) or a
//! [`DomainError`] into the `anyhow` chain. [`classify_kind`] is a pure
//! function over that chain. [`ErrorReporter::report`] classifies, logs the
//! failure exactly once with structured context and hands back a
//! [`ClassifiedError`], which is the only failure type that travels past
//! this boundary.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{DomainError, OperationId};
use crate::ports::ConnectivityNotifier;

/// Maximum number of characters of a response body kept for diagnostics
pub const BODY_PREVIEW_LIMIT: usize = 500;

/// Maximum number of characters of rendered response headers kept for diagnostics
pub const HEADER_PREVIEW_LIMIT: usize = 500;

// ============================================================================
// ErrorKind
// ============================================================================

/// Classified failure kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Explicit cancellation; benign, never retried
    Aborted,
    /// Connectivity, DNS or timeout failure
    Network,
    /// Structured data expected, something else received
    MalformedResponse,
    /// Anything not matched by another kind
    Unknown,
    /// Caller may not touch the path
    AccessDenied,
    /// Path lies outside the sync root
    PathOutsideRoot,
    /// Existing entry has a different kind
    KindConflict,
    /// Entry is pinned
    Pinned,
    /// Entry has an operation in flight
    Busy,
}

/// What the orchestrator does with a failure of a given kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Treat as a no-op success
    Absorb,
    /// Re-enqueue with backoff, up to the attempt limit
    Retry,
    /// Mark the operation failed and surface it immediately
    Surface,
}

impl ErrorKind {
    /// Returns the stable upper-case name used in logs and storage
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Aborted => "ABORTED",
            ErrorKind::Network => "NETWORK",
            ErrorKind::MalformedResponse => "MALFORMED_RESPONSE",
            ErrorKind::Unknown => "UNKNOWN",
            ErrorKind::AccessDenied => "ACCESS_DENIED",
            ErrorKind::PathOutsideRoot => "PATH_OUTSIDE_ROOT",
            ErrorKind::KindConflict => "KIND_CONFLICT",
            ErrorKind::Pinned => "PINNED",
            ErrorKind::Busy => "BUSY",
        }
    }

    /// Parses a name produced by [`ErrorKind::name`]
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "ABORTED" => ErrorKind::Aborted,
            "NETWORK" => ErrorKind::Network,
            "MALFORMED_RESPONSE" => ErrorKind::MalformedResponse,
            "UNKNOWN" => ErrorKind::Unknown,
            "ACCESS_DENIED" => ErrorKind::AccessDenied,
            "PATH_OUTSIDE_ROOT" => ErrorKind::PathOutsideRoot,
            "KIND_CONFLICT" => ErrorKind::KindConflict,
            "PINNED" => ErrorKind::Pinned,
            "BUSY" => ErrorKind::Busy,
            _ => return None,
        };
        Some(kind)
    }

    /// Retry handling for this kind
    ///
    /// MALFORMED_RESPONSE is retried like UNKNOWN.
    pub fn disposition(&self) -> Disposition {
        match self {
            ErrorKind::Aborted => Disposition::Absorb,
            ErrorKind::Network | ErrorKind::MalformedResponse | ErrorKind::Unknown => {
                Disposition::Retry
            }
            ErrorKind::AccessDenied
            | ErrorKind::PathOutsideRoot
            | ErrorKind::KindConflict
            | ErrorKind::Pinned
            | ErrorKind::Busy => Disposition::Surface,
        }
    }

    /// Returns true if a failure of this kind may be retried
    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Retry
    }

    /// Returns true for the domain validation kinds
    pub fn is_domain(&self) -> bool {
        self.disposition() == Disposition::Surface
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Marker errors
// ============================================================================

/// The operation observed its cancellation signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Connectivity-class failure reported by an adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("network failure: {message}")]
pub struct NetworkFailure {
    /// Adapter-provided description
    pub message: String,
}

impl NetworkFailure {
    /// Creates a network failure with the given description
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// A call that exceeded its deadline
    pub fn timeout(operation: &str, after: std::time::Duration) -> Self {
        Self::new(format!("{operation} timed out after {}ms", after.as_millis()))
    }
}

/// Diagnostic context captured from a response that failed to parse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseDiagnostics {
    /// HTTP status code
    pub status: u16,
    /// Canonical reason phrase
    pub status_text: String,
    /// `Content-Type` header, if present
    pub content_type: Option<String>,
    /// Rendered headers, truncated
    pub headers: String,
    /// Response body, truncated
    pub body: String,
}

impl ResponseDiagnostics {
    /// Builds diagnostics, truncating headers and body to their preview limits
    pub fn new<'a>(
        status: u16,
        status_text: impl Into<String>,
        content_type: Option<String>,
        headers: impl IntoIterator<Item = (&'a str, &'a str)>,
        body: &str,
    ) -> Self {
        let rendered = headers
            .into_iter()
            .map(|(name, value)| format!("{name}: {value}"))
            .collect::<Vec<_>>()
            .join("; ");

        Self {
            status,
            status_text: status_text.into(),
            content_type,
            headers: truncate_chars(&rendered, HEADER_PREVIEW_LIMIT),
            body: truncate_chars(body, BODY_PREVIEW_LIMIT),
        }
    }
}

/// A response expected to be structured data could not be parsed as such
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed response: {} {} ({})", .0.status, .0.status_text, .0.content_type.as_deref().unwrap_or("no content type"))]
pub struct MalformedResponse(pub ResponseDiagnostics);

/// Truncates `s` to at most `limit` characters, marking the cut
pub fn truncate_chars(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        None => s.to_string(),
        Some((cut, _)) => format!("{}…", &s[..cut]),
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Maps a failure chain onto an [`ErrorKind`]
///
/// Pure: no logging and no side effects. The whole chain is inspected for
/// each kind before moving to the next one, so a cancellation wrapped in a
/// network error still classifies as ABORTED.
pub fn classify_kind(error: &anyhow::Error) -> ErrorKind {
    if contains::<Cancelled>(error) {
        return ErrorKind::Aborted;
    }

    if contains::<NetworkFailure>(error) || find::<io::Error>(error).is_some_and(is_network_io) {
        return ErrorKind::Network;
    }

    if contains::<MalformedResponse>(error) || contains::<serde_json::Error>(error) {
        return ErrorKind::MalformedResponse;
    }

    if let Some(kind) = find::<DomainError>(error).and_then(domain_kind) {
        return kind;
    }

    if find::<io::Error>(error).is_some_and(|e| e.kind() == io::ErrorKind::PermissionDenied) {
        return ErrorKind::AccessDenied;
    }

    ErrorKind::Unknown
}

/// Looks for `T` among context layers and `source()` links
fn find<T>(error: &anyhow::Error) -> Option<&T>
where
    T: StdError + Send + Sync + 'static,
{
    error
        .downcast_ref::<T>()
        .or_else(|| error.chain().find_map(|e| e.downcast_ref::<T>()))
}

fn contains<T>(error: &anyhow::Error) -> bool
where
    T: StdError + Send + Sync + 'static,
{
    find::<T>(error).is_some()
}

fn is_network_io(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::AddrNotAvailable
    )
}

/// Kind of a domain error, if it belongs to the surfaced set
pub fn domain_kind(error: &DomainError) -> Option<ErrorKind> {
    match error {
        DomainError::AccessDenied(_) => Some(ErrorKind::AccessDenied),
        DomainError::PathOutsideRoot { .. } => Some(ErrorKind::PathOutsideRoot),
        DomainError::KindConflict { .. } => Some(ErrorKind::KindConflict),
        DomainError::Pinned(_) => Some(ErrorKind::Pinned),
        DomainError::Busy(_) => Some(ErrorKind::Busy),
        _ => None,
    }
}

/// Finds the [`ResponseDiagnostics`] carried by a malformed response, if any
fn find_diagnostics(error: &anyhow::Error) -> Option<ResponseDiagnostics> {
    find::<MalformedResponse>(error).map(|m| m.0.clone())
}

// ============================================================================
// ClassifiedError
// ============================================================================

/// Identifies the operation a failure belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpContext {
    /// Short operation name, e.g. `hydrate` or `upload`
    pub operation: String,
    /// Queue identifier, when the failure comes from a queued operation
    pub operation_id: Option<OperationId>,
    /// Path the operation acts on
    pub path: Option<String>,
    /// Attempt number, starting at 0
    pub attempt: u32,
}

impl OpContext {
    /// Creates a context for a one-off operation
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            operation_id: None,
            path: None,
            attempt: 0,
        }
    }

    /// Attaches a queue operation id
    pub fn with_operation_id(mut self, id: OperationId) -> Self {
        self.operation_id = Some(id);
        self
    }

    /// Attaches the affected path
    pub fn with_path(mut self, path: impl fmt::Display) -> Self {
        self.path = Some(path.to_string());
        self
    }

    /// Sets the attempt number
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

/// A failure after classification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} during {operation}: {message}")]
pub struct ClassifiedError {
    /// Classified kind
    pub kind: ErrorKind,
    /// Operation name
    pub operation: String,
    /// Queue identifier, if any
    pub operation_id: Option<OperationId>,
    /// Attempt number
    pub attempt: u32,
    /// Human-readable message, truncated
    pub message: String,
    /// Response diagnostics for MALFORMED_RESPONSE
    pub diagnostics: Option<ResponseDiagnostics>,
    /// When the failure was classified
    pub at: DateTime<Utc>,
}

impl ClassifiedError {
    /// Retry handling for this failure
    pub fn disposition(&self) -> Disposition {
        self.kind.disposition()
    }

    /// Returns true if the failure may be retried
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns true if the failure is a benign cancellation
    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::Aborted
    }
}

/// Classifies failures, logs each one once and notifies on connectivity loss
#[derive(Clone, Default)]
pub struct ErrorReporter {
    notifier: Option<Arc<dyn ConnectivityNotifier>>,
}

impl ErrorReporter {
    /// Creates a reporter without a connectivity notifier
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a reporter that forwards NETWORK failures to `notifier`
    pub fn with_notifier(notifier: Arc<dyn ConnectivityNotifier>) -> Self {
        Self {
            notifier: Some(notifier),
        }
    }

    /// Classifies `error`, logs it and returns the typed result
    ///
    /// Callers must not log the returned error again.
    pub fn report(&self, ctx: &OpContext, error: &anyhow::Error) -> ClassifiedError {
        let kind = classify_kind(error);
        let raw = format!("{error:#}");
        let classified = ClassifiedError {
            kind,
            operation: ctx.operation.clone(),
            operation_id: ctx.operation_id,
            attempt: ctx.attempt,
            message: truncate_chars(&raw, BODY_PREVIEW_LIMIT),
            diagnostics: find_diagnostics(error),
            at: Utc::now(),
        };

        self.log(ctx, &classified, &raw);

        if kind == ErrorKind::Network {
            if let Some(notifier) = &self.notifier {
                notifier.connectivity_issue(&classified);
            }
        }

        classified
    }

    fn log(&self, ctx: &OpContext, classified: &ClassifiedError, raw: &str) {
        let operation_id = ctx.operation_id.map(|id| id.to_string()).unwrap_or_default();
        let path = ctx.path.as_deref().unwrap_or("");

        match classified.kind {
            ErrorKind::Aborted => tracing::debug!(
                operation = %ctx.operation,
                operation_id = %operation_id,
                path,
                attempt = ctx.attempt,
                kind = %classified.kind,
                "Operation aborted"
            ),
            ErrorKind::Network => tracing::warn!(
                operation = %ctx.operation,
                operation_id = %operation_id,
                path,
                attempt = ctx.attempt,
                kind = %classified.kind,
                error = %classified.message,
                "Network failure"
            ),
            ErrorKind::MalformedResponse => {
                let d = classified.diagnostics.as_ref();
                tracing::warn!(
                    operation = %ctx.operation,
                    operation_id = %operation_id,
                    path,
                    attempt = ctx.attempt,
                    kind = %classified.kind,
                    status = d.map(|d| d.status).unwrap_or_default(),
                    status_text = d.map(|d| d.status_text.as_str()).unwrap_or(""),
                    content_type = d.and_then(|d| d.content_type.as_deref()).unwrap_or(""),
                    headers = d.map(|d| d.headers.as_str()).unwrap_or(""),
                    body = d.map(|d| d.body.as_str()).unwrap_or(""),
                    "Malformed response"
                )
            }
            ErrorKind::Unknown => tracing::warn!(
                operation = %ctx.operation,
                operation_id = %operation_id,
                path,
                attempt = ctx.attempt,
                kind = %classified.kind,
                error = %truncate_chars(raw, BODY_PREVIEW_LIMIT),
                "Operation failed"
            ),
            _ => tracing::info!(
                operation = %ctx.operation,
                operation_id = %operation_id,
                path,
                attempt = ctx.attempt,
                kind = %classified.kind,
                error = %classified.message,
                "Operation rejected"
            ),
        }
    }
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

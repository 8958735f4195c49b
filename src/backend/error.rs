//! # Backend Error Types
//!
//! Defines error types for release operations with classification of
//! transient vs permanent-for-the-current-spec failures.
//!
//! The control loop retries both classes on the same fixed schedule; the
//! classification only shapes the condition reason and the metrics label.

use thiserror::Error;

/// Release operation failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Release name already in use (install of an existing release)
    #[error("release already exists: {0}")]
    AlreadyExists(String),
    /// Release does not exist
    #[error("release not found: {0}")]
    NotFound(String),
    /// Chart or chart version could not be resolved in the repository
    #[error("chart not found: {0}")]
    ChartNotFound(String),
    /// Backend rejected the request (bad values, bad manifest)
    #[error("invalid release spec: {0}")]
    InvalidSpec(String),
    /// Operation did not finish in time
    #[error("release operation timed out: {0}")]
    Timeout(String),
    /// Another operation holds the release
    #[error("release busy: {0}")]
    Busy(String),
    /// Backend or chart repository unreachable
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// Unclassified failure
    #[error("release operation failed: {0}")]
    Other(String),
}

impl BackendError {
    /// Whether the failure may clear up without a spec edit
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Timeout(_)
                | BackendError::Busy(_)
                | BackendError::Unavailable(_)
                | BackendError::Other(_)
        )
    }

    /// Stable reason string for conditions, events and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            BackendError::AlreadyExists(_) => "AlreadyExists",
            BackendError::NotFound(_) => "ReleaseNotFound",
            BackendError::ChartNotFound(_) => "ChartNotFound",
            BackendError::InvalidSpec(_) => "InvalidSpec",
            BackendError::Timeout(_) => "Timeout",
            BackendError::Busy(_) => "BackendBusy",
            BackendError::Unavailable(_) => "BackendUnavailable",
            BackendError::Other(_) => "BackendError",
        }
    }
}

/// Classify helm stderr output into a [`BackendError`]
///
/// Matching is on well-known helm/client-go message fragments. Anything not
/// recognised is `Other`, which is treated as transient.
pub fn classify_helm_error(stderr: &str) -> BackendError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    if lower.contains("cannot re-use a name that is still in use") {
        BackendError::AlreadyExists(message)
    } else if lower.contains("another operation (install/upgrade/rollback) is in progress") {
        BackendError::Busy(message)
    } else if lower.contains("release: not found") || lower.contains("has no deployed releases")
    {
        BackendError::NotFound(message)
    } else if lower.contains("timed out")
        || lower.contains("context deadline exceeded")
        || lower.contains("i/o timeout")
    {
        BackendError::Timeout(message)
    } else if lower.contains("connection refused")
        || lower.contains("no such host")
        || lower.contains("service unavailable")
        || lower.contains("tls handshake")
        || lower.contains("502")
        || lower.contains("503")
    {
        BackendError::Unavailable(message)
    } else if (lower.contains("chart") && lower.contains("not found"))
        || lower.contains("no chart version found")
        || lower.contains("failed to fetch")
    {
        BackendError::ChartNotFound(message)
    } else if lower.contains("unable to build kubernetes objects")
        || lower.contains("parse error")
        || lower.contains("values don't meet the specifications")
        || lower.contains("execution error")
    {
        BackendError::InvalidSpec(message)
    } else {
        BackendError::Other(message)
    }
}

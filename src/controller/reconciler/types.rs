//! # Reconciler Types
//!
//! Shared context, outcome and error types for reconciliation.

use crate::backend::ReleaseBackend;
use crate::store::{ReleaseStore, StoreError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Reconciler context shared by all workers
#[derive(Clone)]
pub struct Reconciler {
    pub store: Arc<dyn ReleaseStore>,
    pub backend: Arc<dyn ReleaseBackend>,
    /// Fixed backoff after a failed attempt
    pub failure_requeue: Duration,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("failure_requeue", &self.failure_requeue)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        backend: Arc<dyn ReleaseBackend>,
        failure_requeue: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            failure_requeue,
        }
    }
}

/// What the control loop should do with a key after a reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Desired state reached; clear retry state and wait for the next change
    Done,
    /// Try again after the given delay
    Requeue(Duration),
}

/// Reconciliation failures that are not recorded on the status.
///
/// Backend failures never show up here: they are written to the status as
/// phase `Failed` and turned into a [`ReconcileOutcome::Requeue`].
#[derive(Debug, Error)]
pub enum ReconcilerError {
    /// A status or metadata write lost an optimistic-concurrency race
    #[error("conflicting write to {0}, reconciling again")]
    Conflict(String),
    /// The record cannot be processed (e.g. no identity)
    #[error("invalid object: {0}")]
    InvalidObject(String),
    /// Store unreachable or rejected the request
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    /// Reconciliation did not finish within its deadline
    #[error("reconciliation exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),
}

impl From<StoreError> for ReconcilerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(key) => ReconcilerError::Conflict(key),
            StoreError::InvalidObject(message) => ReconcilerError::InvalidObject(message),
            other => ReconcilerError::Store(other),
        }
    }
}

impl ReconcilerError {
    /// Label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcilerError::Conflict(_) => "conflict",
            ReconcilerError::InvalidObject(_) => "invalid-object",
            ReconcilerError::Store(_) => "store",
            ReconcilerError::DeadlineExceeded(_) => "deadline",
        }
    }
}

//! # Desired-State Store
//!
//! Reads and writes `HelmRelease` records and their status. Every write is
//! conditional on the record's `resourceVersion`; a concurrent writer makes
//! the write fail with [`StoreError::Conflict`] instead of being overwritten.
//!
//! ## Implementations
//!
//! - `kubernetes` - Kubernetes API server via `kube::Api`
//! - `memory` - in-process store with API-server semantics, used by tests

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeStore;
pub use memory::MemoryStore;

use crate::crd::{HelmRelease, HelmReleaseStatus};
use kube::ResourceExt;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identity of a record: `(namespace, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a record, `None` if the record lacks a name or namespace
    pub fn of(hr: &HelmRelease) -> Option<Self> {
        let name = hr.metadata.name.as_deref().filter(|n| !n.is_empty())?;
        let namespace = hr.namespace().filter(|n| !n.is_empty())?;
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(StoreError::InvalidObject(format!(
                "'{s}' is not a namespace/name key"
            ))),
        }
    }
}

/// Store operation failure
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic-concurrency precondition failed
    #[error("conflicting write to {0}")]
    Conflict(String),
    /// Record does not exist (any more)
    #[error("record not found: {0}")]
    NotFound(String),
    /// Record is malformed (missing identity, unreadable fields)
    #[error("invalid record: {0}")]
    InvalidObject(String),
    /// Kubernetes API failure
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
    /// Any other store failure
    #[error("store error: {0}")]
    Other(String),
}

/// Severity of a recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// Human-readable record attached to a `HelmRelease`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseEvent {
    pub kind: EventKind,
    /// Short CamelCase reason (e.g. `Installing`, `ChartNotFound`)
    pub reason: String,
    /// What the controller was doing (e.g. `Install`)
    pub action: String,
    pub message: String,
}

impl ReleaseEvent {
    pub fn normal(reason: &str, action: &str, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Normal,
            reason: reason.to_string(),
            action: action.to_string(),
            message: message.into(),
        }
    }

    pub fn warning(reason: &str, action: &str, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Warning,
            reason: reason.to_string(),
            action: action.to_string(),
            message: message.into(),
        }
    }
}

/// Access to desired-state records
#[async_trait]
pub trait ReleaseStore: Send + Sync {
    /// Fetch the latest version of a record
    async fn get(&self, key: &ObjectKey) -> Result<Option<HelmRelease>, StoreError>;

    /// All records visible to the controller
    async fn list(&self) -> Result<Vec<HelmRelease>, StoreError>;

    /// Attach the controller finalizer. Returns the updated record.
    async fn add_finalizer(&self, hr: &HelmRelease) -> Result<HelmRelease, StoreError>;

    /// Detach the controller finalizer. The store may erase the record as a
    /// result, so nothing is returned.
    async fn remove_finalizer(&self, hr: &HelmRelease) -> Result<(), StoreError>;

    /// Replace the status sub-record. Returns the updated record.
    async fn update_status(
        &self,
        hr: &HelmRelease,
        status: &HelmReleaseStatus,
    ) -> Result<HelmRelease, StoreError>;

    /// Attach an event to the record
    async fn publish_event(&self, hr: &HelmRelease, event: ReleaseEvent)
        -> Result<(), StoreError>;
}

//! # Release Backend
//!
//! The only component that mutates cluster-external state. Every install,
//! upgrade and uninstall of a release goes through the [`ReleaseBackend`]
//! trait, so the reconciler can be exercised against an in-memory fake.
//!
//! ## Implementations
//!
//! - `helm` - drives the `helm` binary through `tokio::process`
//! - `memory` - in-process fake that records calls, used by tests

mod error;
pub mod helm;
pub mod memory;

pub use error::{classify_helm_error, BackendError};
pub use helm::HelmCliBackend;
pub use memory::MemoryBackend;

use crate::crd::{HelmRelease, Values};
use async_trait::async_trait;
use std::fmt;

/// Identity and coordinates of one release
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleRef {
    /// Helm release name
    pub release_name: String,
    /// Namespace the release lives in
    pub namespace: String,
    /// Chart name inside the repository
    pub chart: String,
    /// Chart repository URL
    pub repo_url: String,
    /// Exact chart version
    pub version: String,
}

impl BundleRef {
    /// The release the current spec asks for
    pub fn from_release(hr: &HelmRelease) -> Self {
        Self {
            release_name: hr.release_name(),
            namespace: hr.spec.target_namespace.clone(),
            chart: hr.spec.chart.clone(),
            repo_url: hr.spec.repo_url.clone(),
            version: hr.spec.version.clone(),
        }
    }

    /// The release recorded by the last successful deploy, which may live
    /// under another name or namespace than the current spec asks for
    pub fn deployed(hr: &HelmRelease) -> Option<Self> {
        let status = hr.status.as_ref()?;
        let (Some(release_name), Some(namespace)) =
            (status.release_name.clone(), status.release_namespace.clone())
        else {
            return None;
        };
        Some(Self {
            release_name,
            namespace,
            ..Self::from_release(hr)
        })
    }

    /// Whether both refer to the same Helm release
    pub fn same_release(&self, other: &BundleRef) -> bool {
        self.release_name == other.release_name && self.namespace == other.namespace
    }
}

impl fmt::Display for BundleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({}@{})",
            self.namespace, self.release_name, self.chart, self.version
        )
    }
}

/// State of a release as reported by the backend itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    Deployed,
    Failed,
    PendingInstall,
    PendingUpgrade,
    Uninstalling,
    Unknown,
}

impl ReleaseState {
    /// Parse Helm's release status string
    pub fn from_helm(status: &str) -> Self {
        match status {
            "deployed" => ReleaseState::Deployed,
            "failed" => ReleaseState::Failed,
            "pending-install" => ReleaseState::PendingInstall,
            "pending-upgrade" | "pending-rollback" => ReleaseState::PendingUpgrade,
            "uninstalling" => ReleaseState::Uninstalling,
            _ => ReleaseState::Unknown,
        }
    }
}

/// What the backend currently holds for a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedRelease {
    Absent,
    Present {
        revision: i64,
        version: String,
        state: ReleaseState,
    },
}

/// Operations the reconciler needs from the release manager
///
/// Implementations surface raw backend results faithfully. In particular a
/// second `install` of the same release must return
/// [`BackendError::AlreadyExists`] rather than pretend success; deciding that
/// this is recoverable is the reconciler's job.
#[async_trait]
pub trait ReleaseBackend: Send + Sync {
    /// Observe the current release
    async fn status(&self, bundle: &BundleRef) -> Result<ObservedRelease, BackendError>;

    /// Install a release that does not exist yet. Returns the new revision.
    async fn install(&self, bundle: &BundleRef, values: &Values) -> Result<i64, BackendError>;

    /// Upgrade an existing release. Returns the new revision.
    async fn upgrade(&self, bundle: &BundleRef, values: &Values) -> Result<i64, BackendError>;

    /// Tear the release down
    async fn uninstall(&self, bundle: &BundleRef) -> Result<(), BackendError>;
}

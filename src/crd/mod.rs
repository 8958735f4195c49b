//! # Custom Resource Definitions
//!
//! CRD types for the Helm Release Controller.
//!
//! This module contains the `HelmRelease` custom resource: the user-authored
//! desired state of a single Helm release, plus the operator-owned status
//! sub-record the reconciler writes back.

mod status;
mod values;

pub use status::{Condition, HelmReleaseStatus, Phase, CONDITION_READY};
pub use values::Values;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer token attached by the reconciler.
///
/// The API server defers physical deletion of a `HelmRelease` while this token
/// is present, which is what guarantees the external release is torn down
/// before the record disappears.
pub const FINALIZER: &str = "helm.releases.io/finalizer";

/// HelmRelease Custom Resource Definition
///
/// Declares the target configuration of one Helm release.
///
/// # Example
///
/// ```yaml
/// apiVersion: helm.releases.io/v1alpha1
/// kind: HelmRelease
/// metadata:
///   name: web
///   namespace: default
/// spec:
///   chart: nginx
///   repoURL: https://charts.bitnami.com/bitnami
///   version: 15.0.0
///   targetNamespace: demo
///   values:
///     replicaCount: 2
/// ```
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    kind = "HelmRelease",
    group = "helm.releases.io",
    version = "v1alpha1",
    namespaced,
    status = "HelmReleaseStatus",
    shortname = "hr",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}, {"name":"Version", "type":"string", "jsonPath":".status.deployedVersion"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSpec {
    /// Chart name inside the repository (e.g. "nginx")
    pub chart: String,
    /// Chart repository URL (http, https or oci)
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    /// Exact chart version - ranges are rejected
    pub version: String,
    /// Namespace the release is installed into
    pub target_namespace: String,
    /// Release name override. Defaults to the HelmRelease name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    /// Values passed to the chart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Values>,
}

impl HelmRelease {
    /// Name of the Helm release this record manages
    pub fn release_name(&self) -> String {
        self.spec
            .release_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.name_any())
    }

    /// Whether the reconciler's finalizer is attached
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    /// Whether the record has been marked for deletion
    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Current phase, `None` if the reconciler has never written status
    pub fn phase(&self) -> Option<Phase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    /// Generation of the spec as tracked by the API server
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }
}

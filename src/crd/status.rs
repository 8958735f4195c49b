//! # HelmRelease Status
//!
//! Status types for tracking reconciliation state and conditions.

use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Condition type mirrored on every phase transition
pub const CONDITION_READY: &str = "Ready";

/// Maximum entries kept per condition type. Older entries of the same type are
/// dropped first so the list cannot grow without bound across many failures.
pub const MAX_CONDITIONS_PER_TYPE: usize = 8;

/// Lifecycle phase of a HelmRelease as tracked by the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Phase {
    Pending,
    Installing,
    Ready,
    Upgrading,
    Uninstalling,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Installing => "Installing",
            Phase::Ready => "Ready",
            Phase::Upgrading => "Upgrading",
            Phase::Uninstalling => "Uninstalling",
            Phase::Failed => "Failed",
        }
    }

    /// Phases during which a backend call may have been left in flight
    pub fn is_in_progress(self) -> bool {
        matches!(
            self,
            Phase::Installing | Phase::Upgrading | Phase::Uninstalling
        )
    }
}

impl JsonSchema for Phase {
    fn schema_name() -> Cow<'static, str> {
        Cow::Borrowed("Phase")
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        // Plain string enum keeps the CRD schema structural
        let schema_value = serde_json::json!({
            "type": "string",
            "enum": ["Pending", "Installing", "Ready", "Upgrading", "Uninstalling", "Failed"],
            "description": "Lifecycle phase of the release."
        });
        Schema::try_from(schema_value).expect("Failed to create Schema for Phase")
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of the HelmRelease resource
///
/// Owned exclusively by the reconciler. Never edited by users.
#[derive(Debug, Clone, Deserialize, Serialize, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseStatus {
    /// Current phase of reconciliation
    #[serde(default)]
    pub phase: Option<Phase>,
    /// Conditions represent the latest available observations, oldest first
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Chart version of the last successful install or upgrade
    #[serde(default)]
    pub deployed_version: Option<String>,
    /// Release revision reported by Helm for the last successful deploy
    #[serde(default)]
    pub helm_revision: Option<i64>,
    /// Time of the last successful deploy (RFC3339)
    #[serde(default)]
    pub last_deployed_at: Option<String>,
    /// Helm release name of the last successful deploy
    #[serde(default)]
    pub release_name: Option<String>,
    /// Namespace of the last successful deploy
    #[serde(default)]
    pub release_namespace: Option<String>,
    /// Generation of the spec this status was computed from
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

/// Condition represents a condition of a resource
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: String,
    /// Last transition time
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Reason for the condition
    #[serde(default)]
    pub reason: Option<String>,
    /// Message describing the condition
    #[serde(default)]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(r#type: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == "True"
    }

    fn same_state(&self, other: &Condition) -> bool {
        self.r#type == other.r#type && self.status == other.status && self.reason == other.reason
    }
}

impl HelmReleaseStatus {
    /// Most recent condition of the given type
    pub fn latest_condition(&self, r#type: &str) -> Option<&Condition> {
        self.conditions.iter().rev().find(|c| c.r#type == r#type)
    }

    /// Record a condition.
    ///
    /// A new entry is appended only when type, status or reason differ from
    /// the most recent entry of the same type. Returns whether the list
    /// changed.
    pub fn push_condition(&mut self, condition: Condition) -> bool {
        if let Some(latest) = self.latest_condition(&condition.r#type) {
            if latest.same_state(&condition) {
                return false;
            }
        }

        let kind = condition.r#type.clone();
        self.conditions.push(condition);

        let same_kind = self.conditions.iter().filter(|c| c.r#type == kind).count();
        if same_kind > MAX_CONDITIONS_PER_TYPE {
            let excess = same_kind - MAX_CONDITIONS_PER_TYPE;
            let mut dropped = 0;
            self.conditions.retain(|c| {
                if dropped < excess && c.r#type == kind {
                    dropped += 1;
                    false
                } else {
                    true
                }
            });
        }
        true
    }

    /// Raise `observedGeneration` to `generation`, never lowering it
    pub fn observe_generation(&mut self, generation: i64) {
        let current = self.observed_generation.unwrap_or(0);
        self.observed_generation = Some(current.max(generation));
    }
}

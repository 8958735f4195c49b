//! # Kubernetes Lease
//!
//! [`LeaseLock`] over a `coordination.k8s.io/v1` Lease. Replacement is a
//! JSON merge patch carrying `metadata.resourceVersion`, so a concurrent
//! writer turns our write into a 409.

use super::{LeaderElectionError, LeaseLock, LeaseRecord};
use crate::constants;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::{json, Value};
use std::time::Duration;

/// Lease-backed [`LeaseLock`]
pub struct KubeLeaseLock {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl std::fmt::Debug for KubeLeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeLeaseLock")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeLeaseLock {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn invalid(&self, message: impl Into<String>) -> LeaderElectionError {
        LeaderElectionError::Invalid {
            name: self.describe(),
            message: message.into(),
        }
    }

    fn classify(&self, err: kube::Error) -> LeaderElectionError {
        match err {
            kube::Error::Api(api_err) if api_err.code == 409 => {
                LeaderElectionError::Conflict(self.describe())
            }
            other => LeaderElectionError::Kube(other),
        }
    }

    fn to_record(&self, lease: Lease) -> Result<LeaseRecord, LeaderElectionError> {
        let version = lease.metadata.resource_version.clone();
        let spec = serde_json::to_value(lease.spec.unwrap_or_default())
            .map_err(|e| self.invalid(e.to_string()))?;
        record_from_spec(&spec, version).map_err(|message| self.invalid(message))
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn spec_json(record: &LeaseRecord) -> Value {
    let seconds = i32::try_from(record.lease_duration.as_secs()).unwrap_or(i32::MAX);
    json!({
        "holderIdentity": record.holder,
        "leaseDurationSeconds": seconds,
        "acquireTime": timestamp(&record.acquired_at),
        "renewTime": timestamp(&record.renewed_at),
        "leaseTransitions": record.transitions,
    })
}

fn parse_time(spec: &Value, field: &str) -> Result<DateTime<Utc>, String> {
    match spec.get(field).and_then(Value::as_str) {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| format!("{field} {raw:?}: {e}")),
        // Leases created by other tools may omit the times
        None => Ok(DateTime::<Utc>::UNIX_EPOCH),
    }
}

fn record_from_spec(spec: &Value, version: Option<String>) -> Result<LeaseRecord, String> {
    let seconds = spec
        .get("leaseDurationSeconds")
        .and_then(Value::as_u64)
        .unwrap_or(constants::DEFAULT_LEASE_DURATION_SECS);
    let transitions = spec
        .get("leaseTransitions")
        .and_then(Value::as_i64)
        .and_then(|t| i32::try_from(t).ok())
        .unwrap_or(0);
    Ok(LeaseRecord {
        holder: spec
            .get("holderIdentity")
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
            .map(str::to_string),
        lease_duration: Duration::from_secs(seconds),
        acquired_at: parse_time(spec, "acquireTime")?,
        renewed_at: parse_time(spec, "renewTime")?,
        transitions,
        version,
    })
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError> {
        match self.api.get_opt(&self.name).await? {
            Some(lease) => self.to_record(lease).map(Some),
            None => Ok(None),
        }
    }

    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaderElectionError> {
        let lease: Lease = serde_json::from_value(json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": { "name": self.name, "namespace": self.namespace },
            "spec": spec_json(record),
        }))
        .map_err(|e| self.invalid(e.to_string()))?;

        let params = PostParams {
            field_manager: Some(constants::FIELD_MANAGER.to_string()),
            ..PostParams::default()
        };
        match self.api.create(&params, &lease).await {
            Ok(created) => self.to_record(created),
            Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                Err(LeaderElectionError::AlreadyExists(self.describe()))
            }
            Err(e) => Err(self.classify(e)),
        }
    }

    async fn replace(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaderElectionError> {
        let Some(version) = record.version.as_deref() else {
            return Err(LeaderElectionError::Conflict(self.describe()));
        };
        let patch = json!({
            "metadata": { "resourceVersion": version },
            "spec": spec_json(record),
        });
        let replaced = self
            .api
            .patch(
                &self.name,
                &PatchParams::apply(constants::FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await
            .map_err(|e| self.classify(e))?;
        self.to_record(replaced)
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

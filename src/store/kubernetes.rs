//! # Kubernetes Store
//!
//! `HelmRelease` access through the Kubernetes API server.
//!
//! Writes are JSON merge patches that carry `metadata.resourceVersion`; the
//! API server rejects them with 409 when the record changed underneath us,
//! which surfaces as [`StoreError::Conflict`].

use super::{EventKind, ObjectKey, ReleaseEvent, ReleaseStore, StoreError};
use crate::constants;
use crate::crd::{HelmRelease, HelmReleaseStatus, FINALIZER};
use async_trait::async_trait;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::debug;

/// Kubernetes-backed [`ReleaseStore`]
pub struct KubeStore {
    client: Client,
    /// Restrict list/watch to one namespace
    namespace: Option<String>,
    recorder: Recorder,
}

impl std::fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeStore {
    pub fn new(client: Client, namespace: Option<String>, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: constants::FIELD_MANAGER.to_string(),
            instance,
        };
        let recorder = Recorder::new(client.clone(), reporter);
        Self {
            client,
            namespace,
            recorder,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// API scoped to the watched namespace, or all namespaces
    pub fn scoped_api(&self) -> Api<HelmRelease> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn api(&self, namespace: &str) -> Api<HelmRelease> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn key_of(hr: &HelmRelease) -> Result<ObjectKey, StoreError> {
    ObjectKey::of(hr).ok_or_else(|| {
        StoreError::InvalidObject("HelmRelease without name or namespace".to_string())
    })
}

fn resource_version(hr: &HelmRelease) -> Result<String, StoreError> {
    hr.resource_version().ok_or_else(|| {
        StoreError::InvalidObject(format!("{} has no resourceVersion", hr.name_any()))
    })
}

/// Map API errors: 409 is an optimistic-concurrency conflict, 404 a vanished record
fn classify(err: kube::Error, key: &ObjectKey) -> StoreError {
    match err {
        kube::Error::Api(api_err) if api_err.code == 409 => StoreError::Conflict(key.to_string()),
        kube::Error::Api(api_err) if api_err.code == 404 => StoreError::NotFound(key.to_string()),
        other => StoreError::Kube(other),
    }
}

fn finalizer_patch(hr: &HelmRelease, finalizers: Vec<String>) -> Result<Patch<serde_json::Value>, StoreError> {
    Ok(Patch::Merge(serde_json::json!({
        "metadata": {
            "resourceVersion": resource_version(hr)?,
            "finalizers": finalizers,
        }
    })))
}

#[async_trait]
impl ReleaseStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<HelmRelease>, StoreError> {
        self.api(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| classify(e, key))
    }

    async fn list(&self) -> Result<Vec<HelmRelease>, StoreError> {
        let list = self.scoped_api().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn add_finalizer(&self, hr: &HelmRelease) -> Result<HelmRelease, StoreError> {
        let key = key_of(hr)?;
        let mut finalizers = hr.finalizers().to_vec();
        if !finalizers.iter().any(|f| f == FINALIZER) {
            finalizers.push(FINALIZER.to_string());
        }
        self.api(&key.namespace)
            .patch(
                &key.name,
                &PatchParams::apply(constants::FIELD_MANAGER),
                &finalizer_patch(hr, finalizers)?,
            )
            .await
            .map_err(|e| classify(e, &key))
    }

    async fn remove_finalizer(&self, hr: &HelmRelease) -> Result<(), StoreError> {
        let key = key_of(hr)?;
        let finalizers: Vec<String> = hr
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        match self
            .api(&key.namespace)
            .patch(
                &key.name,
                &PatchParams::apply(constants::FIELD_MANAGER),
                &finalizer_patch(hr, finalizers)?,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(api_err)) if api_err.code == 404 => {
                // Already erased - this is the outcome we wanted
                debug!("HelmRelease {} already gone while removing finalizer", key);
                Ok(())
            }
            Err(e) => Err(classify(e, &key)),
        }
    }

    async fn update_status(
        &self,
        hr: &HelmRelease,
        status: &HelmReleaseStatus,
    ) -> Result<HelmRelease, StoreError> {
        let key = key_of(hr)?;
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": resource_version(hr)? },
            "status": status
        });
        self.api(&key.namespace)
            .patch_status(
                &key.name,
                &PatchParams::apply(constants::FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await
            .map_err(|e| classify(e, &key))
    }

    async fn publish_event(
        &self,
        hr: &HelmRelease,
        event: ReleaseEvent,
    ) -> Result<(), StoreError> {
        let type_ = match event.kind {
            EventKind::Normal => EventType::Normal,
            EventKind::Warning => EventType::Warning,
        };
        self.recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason,
                    note: Some(event.message),
                    action: event.action,
                    secondary: None,
                },
                &hr.object_ref(&()),
            )
            .await?;
        Ok(())
    }
}

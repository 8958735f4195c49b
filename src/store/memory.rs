//! # In-Memory Store
//!
//! A [`ReleaseStore`] that behaves like the API server for the parts the
//! reconciler depends on:
//!
//! - `resourceVersion` bumps on every write and is checked on every write
//! - `generation` bumps only when the spec changes
//! - deletion is deferred while finalizers remain
//! - every change is broadcast to subscribed change sources
//!
//! Used by the test suite and for running the control loop without a cluster.

use super::{ObjectKey, ReleaseEvent, ReleaseStore, StoreError};
use crate::controller::source::ChangeSource;
use crate::crd::{HelmRelease, HelmReleaseSpec, HelmReleaseStatus, Phase, FINALIZER};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const CHANGE_BUFFER: usize = 1024;

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<ObjectKey, HelmRelease>,
    next_resource_version: u64,
    events: Vec<(ObjectKey, ReleaseEvent)>,
    injected_conflicts: usize,
    status_writes: usize,
    phases: Vec<(ObjectKey, Phase)>,
    erased: Vec<ObjectKey>,
}

impl State {
    fn bump(&mut self, hr: &mut HelmRelease) {
        self.next_resource_version += 1;
        hr.metadata.resource_version = Some(self.next_resource_version.to_string());
    }

    /// Fetch the stored record for a conditional write
    fn current(&mut self, hr: &HelmRelease) -> Result<(ObjectKey, HelmRelease), StoreError> {
        let key = ObjectKey::of(hr).ok_or_else(|| {
            StoreError::InvalidObject("HelmRelease without name or namespace".to_string())
        })?;
        let stored = self
            .records
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        if self.injected_conflicts > 0 {
            self.injected_conflicts -= 1;
            return Err(StoreError::Conflict(key.to_string()));
        }
        if stored.metadata.resource_version != hr.metadata.resource_version {
            return Err(StoreError::Conflict(key.to_string()));
        }
        Ok((key, stored))
    }
}

/// In-memory [`ReleaseStore`]
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    changes: broadcast::Sender<ObjectKey>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            state: Mutex::default(),
            changes,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn notify(&self, key: ObjectKey) {
        // No subscribers is fine: nobody is watching yet
        let _ = self.changes.send(key);
    }

    /// Create a record as a user would. Sets generation 1 and a uid.
    pub fn create(&self, mut hr: HelmRelease) -> Result<HelmRelease, StoreError> {
        let key = ObjectKey::of(&hr).ok_or_else(|| {
            StoreError::InvalidObject("HelmRelease without name or namespace".to_string())
        })?;
        let created = {
            let mut state = self.lock();
            if state.records.contains_key(&key) {
                return Err(StoreError::Conflict(format!("{key} already exists")));
            }
            hr.metadata.generation = Some(1);
            hr.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
            hr.status = None;
            state.bump(&mut hr);
            state.records.insert(key.clone(), hr.clone());
            hr
        };
        self.notify(key);
        Ok(created)
    }

    /// Insert a record verbatim, bypassing API-server bookkeeping.
    ///
    /// Lets tests stage states that are hard to reach through the public
    /// operations (e.g. a record whose identity was blanked).
    pub fn insert_raw(&self, key: ObjectKey, hr: HelmRelease) {
        self.lock().records.insert(key.clone(), hr);
        self.notify(key);
    }

    /// Edit the spec as a user would. Bumps generation if the spec changed.
    pub fn edit_spec(
        &self,
        key: &ObjectKey,
        edit: impl FnOnce(&mut HelmReleaseSpec),
    ) -> Result<HelmRelease, StoreError> {
        let updated = {
            let mut state = self.lock();
            let mut hr = state
                .records
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
            let before = hr.spec.clone();
            edit(&mut hr.spec);
            if hr.spec != before {
                hr.metadata.generation = Some(hr.metadata.generation.unwrap_or(0) + 1);
            }
            state.bump(&mut hr);
            state.records.insert(key.clone(), hr.clone());
            hr
        };
        self.notify(key.clone());
        Ok(updated)
    }

    /// Request deletion as a user would.
    ///
    /// Without finalizers the record is erased immediately; otherwise only
    /// the deletion timestamp is set.
    pub fn request_delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        {
            let mut state = self.lock();
            let mut hr = state
                .records
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

            if hr.metadata.finalizers.as_ref().is_none_or(Vec::is_empty) {
                state.records.remove(key);
                state.erased.push(key.clone());
            } else if hr.metadata.deletion_timestamp.is_none() {
                let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
                let timestamp: Time = serde_json::from_value(serde_json::json!(now))
                    .map_err(|e| StoreError::Other(format!("Failed to build timestamp: {e}")))?;
                hr.metadata.deletion_timestamp = Some(timestamp);
                state.bump(&mut hr);
                state.records.insert(key.clone(), hr);
            }
        }
        self.notify(key.clone());
        Ok(())
    }

    /// Make the next `count` conditional writes fail with a conflict
    pub fn inject_conflicts(&self, count: usize) {
        self.lock().injected_conflicts += count;
    }

    pub fn snapshot(&self, key: &ObjectKey) -> Option<HelmRelease> {
        self.lock().records.get(key).cloned()
    }

    /// Whether the record has been physically erased
    pub fn was_erased(&self, key: &ObjectKey) -> bool {
        self.lock().erased.contains(key)
    }

    pub fn events(&self, key: &ObjectKey) -> Vec<ReleaseEvent> {
        self.lock()
            .events
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Total number of successful status writes
    pub fn status_writes(&self) -> usize {
        self.lock().status_writes
    }

    /// Every phase a record entered, in order
    pub fn phase_history(&self, key: &ObjectKey) -> Vec<Phase> {
        self.lock()
            .phases
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, p)| *p)
            .collect()
    }

    /// Change source emitting the key of every record touched from now on
    pub fn change_source(&self) -> MemoryChangeSource {
        MemoryChangeSource {
            receiver: self.changes.subscribe(),
        }
    }
}

#[async_trait]
impl ReleaseStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<HelmRelease>, StoreError> {
        Ok(self.snapshot(key))
    }

    async fn list(&self) -> Result<Vec<HelmRelease>, StoreError> {
        Ok(self.lock().records.values().cloned().collect())
    }

    async fn add_finalizer(&self, hr: &HelmRelease) -> Result<HelmRelease, StoreError> {
        let (key, updated) = {
            let mut state = self.lock();
            let (key, mut stored) = state.current(hr)?;
            let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == FINALIZER) {
                finalizers.push(FINALIZER.to_string());
            }
            state.bump(&mut stored);
            state.records.insert(key.clone(), stored.clone());
            (key, stored)
        };
        self.notify(key);
        Ok(updated)
    }

    async fn remove_finalizer(&self, hr: &HelmRelease) -> Result<(), StoreError> {
        let key = {
            let mut state = self.lock();
            let (key, mut stored) = match state.current(hr) {
                Ok(found) => found,
                Err(StoreError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            if let Some(finalizers) = stored.metadata.finalizers.as_mut() {
                finalizers.retain(|f| f != FINALIZER);
            }
            let unblocked = stored.metadata.finalizers.as_ref().is_none_or(Vec::is_empty);
            if stored.metadata.deletion_timestamp.is_some() && unblocked {
                state.records.remove(&key);
                state.erased.push(key.clone());
            } else {
                state.bump(&mut stored);
                state.records.insert(key.clone(), stored);
            }
            key
        };
        self.notify(key);
        Ok(())
    }

    async fn update_status(
        &self,
        hr: &HelmRelease,
        status: &HelmReleaseStatus,
    ) -> Result<HelmRelease, StoreError> {
        let (key, updated) = {
            let mut state = self.lock();
            let (key, mut stored) = state.current(hr)?;
            let previous = stored.status.as_ref().and_then(|s| s.phase);
            if let Some(phase) = status.phase.filter(|p| Some(*p) != previous) {
                state.phases.push((key.clone(), phase));
            }
            stored.status = Some(status.clone());
            state.bump(&mut stored);
            state.status_writes += 1;
            state.records.insert(key.clone(), stored.clone());
            (key, stored)
        };
        self.notify(key);
        Ok(updated)
    }

    async fn publish_event(
        &self,
        hr: &HelmRelease,
        event: ReleaseEvent,
    ) -> Result<(), StoreError> {
        let key = ObjectKey::of(hr).ok_or_else(|| {
            StoreError::InvalidObject("HelmRelease without name or namespace".to_string())
        })?;
        self.lock().events.push((key, event));
        Ok(())
    }
}

/// Change source fed by [`MemoryStore`] writes
#[derive(Debug)]
pub struct MemoryChangeSource {
    receiver: broadcast::Receiver<ObjectKey>,
}

impl ChangeSource for MemoryChangeSource {
    fn name(&self) -> &str {
        "memory"
    }

    fn changes(self: Box<Self>) -> BoxStream<'static, ObjectKey> {
        stream::unfold(self.receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(key) => return Some((key, receiver)),
                    // Missed notifications are harmless: the queue re-reads the record
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

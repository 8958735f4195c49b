//! # In-Memory Backend
//!
//! Fake release manager used by tests and local dry runs. It keeps releases
//! in a map, records every call, tracks how many calls are in flight per
//! release, and can be told to fail the next N operations.

use super::{BackendError, BundleRef, ObservedRelease, ReleaseBackend, ReleaseState};
use crate::crd::Values;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Operation kinds recorded by the fake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Status,
    Install,
    Upgrade,
    Uninstall,
}

/// One recorded backend call
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub operation: Operation,
    pub release: String,
    pub version: String,
}

/// Release held by the fake
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRelease {
    pub revision: i64,
    pub version: String,
    pub state: ReleaseState,
    pub values: Values,
}

#[derive(Debug, Default)]
struct State {
    releases: HashMap<(String, String), StoredRelease>,
    calls: Vec<RecordedCall>,
    failures: HashMap<Operation, VecDeque<BackendError>>,
    in_flight: HashMap<(String, String), usize>,
    peak_in_flight: usize,
}

/// In-memory [`ReleaseBackend`]
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    latency: Duration,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every mutating call, widening the window for overlap detection
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Mutex::default(),
            latency,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panicking test thread must not wedge the others
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make the next call of `operation` fail with `error`
    pub fn fail_next(&self, operation: Operation, error: BackendError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Place a release directly, as if an earlier process had installed it
    pub fn seed_release(&self, namespace: &str, name: &str, release: StoredRelease) {
        self.lock()
            .releases
            .insert((namespace.to_string(), name.to_string()), release);
    }

    pub fn release(&self, namespace: &str, name: &str) -> Option<StoredRelease> {
        self.lock()
            .releases
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls of one kind
    pub fn count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Number of install/upgrade/uninstall calls
    pub fn mutating_calls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation != Operation::Status)
            .count()
    }

    /// Highest number of concurrent calls observed for any single release
    pub fn peak_in_flight(&self) -> usize {
        self.lock().peak_in_flight
    }

    fn begin(&self, operation: Operation, bundle: &BundleRef) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            operation,
            release: bundle.release_name.clone(),
            version: bundle.version.clone(),
        });
        let key = (bundle.namespace.clone(), bundle.release_name.clone());
        let in_flight = {
            let counter = state.in_flight.entry(key.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        state.peak_in_flight = state.peak_in_flight.max(in_flight);

        if let Some(error) = state.failures.get_mut(&operation).and_then(VecDeque::pop_front) {
            if let Some(counter) = state.in_flight.get_mut(&key) {
                *counter -= 1;
            }
            return Err(error);
        }
        Ok(())
    }

    fn end(&self, bundle: &BundleRef) {
        let key = (bundle.namespace.clone(), bundle.release_name.clone());
        if let Some(counter) = self.lock().in_flight.get_mut(&key) {
            *counter = counter.saturating_sub(1);
        }
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl ReleaseBackend for MemoryBackend {
    async fn status(&self, bundle: &BundleRef) -> Result<ObservedRelease, BackendError> {
        self.begin(Operation::Status, bundle)?;
        let observed = self
            .release(&bundle.namespace, &bundle.release_name)
            .map_or(ObservedRelease::Absent, |r| ObservedRelease::Present {
                revision: r.revision,
                version: r.version,
                state: r.state,
            });
        self.end(bundle);
        Ok(observed)
    }

    async fn install(&self, bundle: &BundleRef, values: &Values) -> Result<i64, BackendError> {
        self.begin(Operation::Install, bundle)?;
        self.pause().await;
        let key = (bundle.namespace.clone(), bundle.release_name.clone());
        let result = {
            let mut state = self.lock();
            if state.releases.contains_key(&key) {
                Err(BackendError::AlreadyExists(format!(
                    "cannot re-use a name that is still in use: {}",
                    bundle.release_name
                )))
            } else {
                state.releases.insert(
                    key,
                    StoredRelease {
                        revision: 1,
                        version: bundle.version.clone(),
                        state: ReleaseState::Deployed,
                        values: values.clone(),
                    },
                );
                Ok(1)
            }
        };
        self.end(bundle);
        result
    }

    async fn upgrade(&self, bundle: &BundleRef, values: &Values) -> Result<i64, BackendError> {
        self.begin(Operation::Upgrade, bundle)?;
        self.pause().await;
        let key = (bundle.namespace.clone(), bundle.release_name.clone());
        let result = {
            let mut state = self.lock();
            match state.releases.get_mut(&key) {
                Some(release) => {
                    release.revision += 1;
                    release.version = bundle.version.clone();
                    release.state = ReleaseState::Deployed;
                    release.values = values.clone();
                    Ok(release.revision)
                }
                None => Err(BackendError::NotFound(format!(
                    "\"{}\" has no deployed releases",
                    bundle.release_name
                ))),
            }
        };
        self.end(bundle);
        result
    }

    async fn uninstall(&self, bundle: &BundleRef) -> Result<(), BackendError> {
        self.begin(Operation::Uninstall, bundle)?;
        self.pause().await;
        let key = (bundle.namespace.clone(), bundle.release_name.clone());
        let removed = self.lock().releases.remove(&key);
        self.end(bundle);
        match removed {
            Some(_) => Ok(()),
            None => Err(BackendError::NotFound(format!(
                "uninstall: Release not loaded: {}: release: not found",
                bundle.release_name
            ))),
        }
    }
}

//! # Change Sources
//!
//! Streams of keys whose records may need reconciliation. The controller is
//! given an explicit list of sources; each one is drained by its own task
//! into a bounded channel in front of the work queue, so a slow queue
//! back-pressures the sources instead of buffering without limit.

use crate::crd::HelmRelease;
use crate::runtime::error_policy::{handle_watch_stream_error, WatchErrorClass};
use crate::store::ObjectKey;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use kube::Api;
use kube_runtime::watcher;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Initial backoff applied when the API server answers 429
const INITIAL_THROTTLE_BACKOFF_MS: u64 = 500;

/// Producer of change notifications
pub trait ChangeSource: Send {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Consume the source into a stream of keys. The stream ends when the
    /// source is exhausted or closed.
    fn changes(self: Box<Self>) -> BoxStream<'static, ObjectKey>;
}

/// Watch on `HelmRelease` records through the Kubernetes API
pub struct KubeChangeSource {
    api: Api<HelmRelease>,
    max_backoff_ms: u64,
}

impl std::fmt::Debug for KubeChangeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeChangeSource")
            .field("max_backoff_ms", &self.max_backoff_ms)
            .finish_non_exhaustive()
    }
}

impl KubeChangeSource {
    pub fn new(api: Api<HelmRelease>, max_backoff_ms: u64) -> Self {
        Self {
            api,
            max_backoff_ms,
        }
    }
}

/// The parts of a record whose change calls for a reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    generation: Option<i64>,
    deleting: bool,
    finalizers: Vec<String>,
}

impl Fingerprint {
    fn of(hr: &HelmRelease) -> Self {
        Self {
            generation: hr.metadata.generation,
            deleting: hr.metadata.deletion_timestamp.is_some(),
            finalizers: hr.metadata.finalizers.clone().unwrap_or_default(),
        }
    }
}

/// Turns watch events into keys, skipping updates that only touched the
/// status. The reconciler's own status writes would otherwise re-queue a
/// record ahead of its scheduled retry.
#[derive(Debug, Default)]
struct ChangeFilter {
    seen: HashMap<ObjectKey, Fingerprint>,
    /// Keys listed so far by a relist in progress
    relisted: Option<HashSet<ObjectKey>>,
}

impl ChangeFilter {
    fn keys_of(&mut self, event: watcher::Event<HelmRelease>) -> Vec<ObjectKey> {
        match event {
            watcher::Event::Apply(hr) => self.admit(&hr).into_iter().collect(),
            watcher::Event::InitApply(hr) => {
                let key = self.admit(&hr);
                if let (Some(relisted), Some(seen)) = (self.relisted.as_mut(), ObjectKey::of(&hr)) {
                    relisted.insert(seen);
                }
                key.into_iter().collect()
            }
            watcher::Event::Delete(hr) => match ObjectKey::of(&hr) {
                Some(key) => {
                    self.seen.remove(&key);
                    vec![key]
                }
                None => {
                    warn!("Ignoring watch event for HelmRelease without name or namespace");
                    Vec::new()
                }
            },
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitDone => {
                // Records missing from the relist were deleted while disconnected
                if let Some(relisted) = self.relisted.take() {
                    self.seen.retain(|key, _| relisted.contains(key));
                }
                Vec::new()
            }
        }
    }

    /// The key of `hr` if it is new or changed beyond its status
    fn admit(&mut self, hr: &HelmRelease) -> Option<ObjectKey> {
        let Some(key) = ObjectKey::of(hr) else {
            warn!("Ignoring watch event for HelmRelease without name or namespace");
            return None;
        };
        let fingerprint = Fingerprint::of(hr);
        if self.seen.get(&key) == Some(&fingerprint) {
            debug!("Skipping status-only update of {}", key);
            return None;
        }
        self.seen.insert(key.clone(), fingerprint);
        Some(key)
    }
}

impl ChangeSource for KubeChangeSource {
    fn name(&self) -> &str {
        "kubernetes-watch"
    }

    fn changes(self: Box<Self>) -> BoxStream<'static, ObjectKey> {
        let backoff = Arc::new(AtomicU64::new(INITIAL_THROTTLE_BACKOFF_MS));
        let max_backoff_ms = self.max_backoff_ms;

        // The watcher relists by itself on the next poll after an error
        watcher(self.api, watcher::Config::default())
            .then(move |event| {
                let backoff = backoff.clone();
                async move {
                    match event {
                        Ok(event) => {
                            backoff.store(INITIAL_THROTTLE_BACKOFF_MS, Ordering::Relaxed);
                            Some(event)
                        }
                        Err(e) => {
                            let class =
                                handle_watch_stream_error(&e.to_string(), &backoff, max_backoff_ms)
                                    .await;
                            if class != WatchErrorClass::NotFound {
                                debug!("Watch restarting after {} error", class.as_str());
                            }
                            None
                        }
                    }
                }
            })
            .filter_map(future::ready)
            .scan(ChangeFilter::default(), |filter, event| {
                future::ready(Some(filter.keys_of(event)))
            })
            .flat_map(stream::iter)
            .boxed()
    }
}

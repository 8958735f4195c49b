//! # Controller
//!
//! The control loop: change sources feed a work queue, a fixed pool of
//! workers drains it, and each worker runs one reconciliation at a time
//! under a deadline. The queue guarantees a key is never handed to two
//! workers at once, so reconciliations of one record are serialized while
//! different records proceed in parallel.

pub mod reconciler;
pub mod server;
pub mod source;

use crate::config::ControllerConfig;
use crate::controller::reconciler::{reconcile, Reconciler, ReconcilerError};
use crate::controller::source::ChangeSource;
use crate::observability;
use crate::queue::WorkQueue;
use crate::runtime::error_policy::handle_reconciliation_result;
use crate::store::ObjectKey;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

/// How the worker pool ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight reconciliation finished within the grace period
    Drained,
    /// The grace period expired and the remaining workers were aborted
    Aborted { in_flight: usize },
}

/// How the control loop is asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Let in-flight reconciliations finish within the grace period
    Drain,
    /// Cancel in-flight reconciliations at once. Used when leadership is
    /// lost and another replica may already be reconciling.
    Abort,
}

/// Control loop over a set of change sources
pub struct Controller {
    reconciler: Arc<Reconciler>,
    config: ControllerConfig,
    sources: Vec<Box<dyn ChangeSource>>,
    queue: Arc<WorkQueue<ObjectKey>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("workers", &self.config.workers)
            .field("sources", &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Controller {
    pub fn new(
        reconciler: Arc<Reconciler>,
        config: ControllerConfig,
        sources: Vec<Box<dyn ChangeSource>>,
    ) -> Self {
        let queue = WorkQueue::new(config.retry_policy());
        Self {
            reconciler,
            config,
            sources,
            queue,
        }
    }

    /// Handle to the work queue, for inspection
    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> {
        self.queue.clone()
    }

    /// Run until `shutdown` resolves, then drain within the grace period
    pub async fn run<F>(self, shutdown: F) -> ShutdownOutcome
    where
        F: Future<Output = ()> + Send,
    {
        self.run_until(async move {
            shutdown.await;
            StopMode::Drain
        })
        .await
    }

    /// Run until `stop` resolves, then wind down the way it asks
    pub async fn run_until<F>(self, stop: F) -> ShutdownOutcome
    where
        F: Future<Output = StopMode> + Send,
    {
        let Controller {
            reconciler,
            config,
            sources,
            queue,
        } = self;

        enqueue_existing(&reconciler, &queue)
            .instrument(tracing::info_span!(
                "controller.startup.enqueue_existing",
                operation = "enqueue_existing"
            ))
            .await;

        let mut feeders = JoinSet::new();
        let (tx, mut rx) = mpsc::channel::<ObjectKey>(config.watch_channel_capacity.max(1));
        for source in sources {
            let tx = tx.clone();
            let name = source.name().to_string();
            feeders.spawn(async move {
                info!("Starting change source {}", name);
                let mut changes = source.changes();
                while let Some(key) = changes.next().await {
                    // Blocks while the channel is full
                    if tx.send(key).await.is_err() {
                        break;
                    }
                }
                debug!("Change source {} ended", name);
            });
        }
        drop(tx);

        let pump_queue = queue.clone();
        feeders.spawn(async move {
            while let Some(key) = rx.recv().await {
                pump_queue.add(key);
                observability::metrics::set_queue_depth(pump_queue.len());
            }
        });

        let mut workers = JoinSet::new();
        for id in 0..config.workers.max(1) {
            workers.spawn(worker(id, reconciler.clone(), queue.clone(), config.clone()));
        }
        info!("Controller running with {} workers", config.workers.max(1));

        let mode = stop.await;
        queue.shut_down();
        feeders.abort_all();

        if mode == StopMode::Abort {
            let in_flight = queue.in_flight();
            warn!(
                "Cancelling controller with {} reconciliations in flight",
                in_flight
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
            return if in_flight == 0 {
                ShutdownOutcome::Drained
            } else {
                ShutdownOutcome::Aborted { in_flight }
            };
        }

        info!(
            "Shutting down controller, waiting up to {}s for {} in-flight reconciliations",
            config.shutdown_grace_period.as_secs(),
            queue.in_flight()
        );

        let drain = async { while workers.join_next().await.is_some() {} };
        if tokio::time::timeout(config.shutdown_grace_period, drain)
            .await
            .is_ok()
        {
            info!("All workers stopped");
            ShutdownOutcome::Drained
        } else {
            let in_flight = queue.in_flight();
            warn!(
                "Grace period expired with {} reconciliations in flight, aborting",
                in_flight
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
            ShutdownOutcome::Aborted { in_flight }
        }
    }
}

/// Enqueue every stored record so state that changed while no controller
/// was running is picked up.
async fn enqueue_existing(reconciler: &Reconciler, queue: &Arc<WorkQueue<ObjectKey>>) {
    let records = match reconciler.store.list().await {
        Ok(records) => records,
        Err(e) => {
            error!("Failed to list existing HelmReleases: {}", e);
            warn!("Continuing; the watch will deliver existing records on its initial listing");
            return;
        }
    };

    let mut by_namespace: HashMap<String, Vec<String>> = HashMap::new();
    for hr in &records {
        match ObjectKey::of(hr) {
            Some(key) => {
                by_namespace
                    .entry(key.namespace.clone())
                    .or_default()
                    .push(key.name.clone());
                queue.add(key);
            }
            None => warn!("Skipping HelmRelease without name or namespace"),
        }
    }

    info!("Startup Resource Summary");
    info!("Resource Kind: HelmRelease");
    info!("Total Resources: {}", records.len());
    info!("Namespaces: {}", by_namespace.len());
    let mut namespaces: Vec<_> = by_namespace.into_iter().collect();
    namespaces.sort();
    for (namespace, mut names) in namespaces {
        names.sort();
        let shown = if names.len() <= 3 {
            names.join(", ")
        } else {
            format!("{}, ... ({} total)", names[..3].join(", "), names.len())
        };
        info!("Namespace: {}", namespace);
        info!("  Resources ({}): {}", names.len(), shown);
    }
    observability::metrics::set_queue_depth(queue.len());
}

async fn worker(
    id: usize,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue<ObjectKey>>,
    config: ControllerConfig,
) {
    debug!("Worker {} started", id);
    while let Some(key) = queue.get().await {
        observability::metrics::set_queue_depth(queue.len());
        let span = tracing::info_span!(
            "controller.reconcile",
            worker = id,
            resource.namespace = %key.namespace,
            resource.name = %key.name
        );
        process(&reconciler, &queue, &key, &config)
            .instrument(span)
            .await;
        queue.done(&key);
    }
    debug!("Worker {} stopped", id);
}

/// One reconciliation of one key, under the configured deadline
async fn process(
    reconciler: &Reconciler,
    queue: &Arc<WorkQueue<ObjectKey>>,
    key: &ObjectKey,
    config: &ControllerConfig,
) {
    observability::metrics::increment_reconciliations();
    let start = Instant::now();

    let result = match tokio::time::timeout(config.reconcile_timeout, reconcile(reconciler, key))
        .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!(
                "Reconciliation of {} exceeded {}s, abandoning this pass",
                key,
                config.reconcile_timeout.as_secs()
            );
            Err(ReconcilerError::DeadlineExceeded(config.reconcile_timeout))
        }
    };

    observability::metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());
    handle_reconciliation_result(queue, key, &result, config.failure_requeue_interval);
}

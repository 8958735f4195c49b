//! Shared fixtures: an in-memory store and backend driven by a real
//! control loop.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use helm_release_controller::backend::MemoryBackend;
use helm_release_controller::config::ControllerConfig;
use helm_release_controller::controller::reconciler::Reconciler;
use helm_release_controller::controller::source::ChangeSource;
use helm_release_controller::controller::{Controller, ShutdownOutcome};
use helm_release_controller::crd::{HelmRelease, HelmReleaseSpec, HelmReleaseStatus, Phase};
use helm_release_controller::queue::WorkQueue;
use helm_release_controller::store::{MemoryStore, ObjectKey, ReleaseStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        workers: 4,
        reconcile_timeout: Duration::from_secs(5),
        failure_requeue_interval: Duration::from_millis(50),
        shutdown_grace_period: Duration::from_secs(5),
        max_immediate_retries: 3,
        immediate_retry_delay: Duration::from_millis(10),
        watch_channel_capacity: 16,
        watch_namespace: None,
        helm_timeout: Duration::from_secs(1),
    }
}

pub fn nginx(version: &str) -> HelmReleaseSpec {
    HelmReleaseSpec {
        chart: "nginx".to_string(),
        repo_url: "https://example/charts".to_string(),
        version: version.to_string(),
        target_namespace: "demo".to_string(),
        release_name: None,
        values: None,
    }
}

pub fn create(store: &MemoryStore, name: &str, spec: HelmReleaseSpec) -> ObjectKey {
    let mut hr = HelmRelease::new(name, spec);
    hr.metadata.namespace = Some("default".to_string());
    let created = store.create(hr).expect("create HelmRelease");
    ObjectKey::of(&created).expect("created record has a key")
}

pub fn status(store: &MemoryStore, key: &ObjectKey) -> HelmReleaseStatus {
    store
        .snapshot(key)
        .and_then(|hr| hr.status)
        .unwrap_or_default()
}

/// Ready at the current generation
pub fn converged(store: &MemoryStore, key: &ObjectKey) -> bool {
    store.snapshot(key).is_some_and(|hr| {
        let status = hr.status.clone().unwrap_or_default();
        status.phase == Some(Phase::Ready) && status.observed_generation == Some(hr.generation())
    })
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A control loop running in the background
pub struct Running {
    pub queue: Arc<WorkQueue<ObjectKey>>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<ShutdownOutcome>,
}

impl Running {
    pub fn start(
        store: Arc<dyn ReleaseStore>,
        source: Box<dyn ChangeSource>,
        backend: Arc<MemoryBackend>,
        config: ControllerConfig,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            store,
            backend,
            config.failure_requeue_interval,
        ));
        let controller = Controller::new(reconciler, config, vec![source]);
        Self::spawn(controller)
    }

    pub fn spawn(controller: Controller) -> Self {
        let queue = controller.queue();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(controller.run(async move {
            let _ = stopped.await;
        }));
        Self {
            queue,
            stop: Some(stop),
            handle,
        }
    }

    pub async fn stop(mut self) -> ShutdownOutcome {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.handle.await.expect("control loop task")
    }
}

/// Control loop over a [`MemoryStore`] and its change feed
pub fn start(store: &Arc<MemoryStore>, backend: &Arc<MemoryBackend>, config: ControllerConfig) -> Running {
    Running::start(
        store.clone(),
        Box::new(store.change_source()),
        backend.clone(),
        config,
    )
}

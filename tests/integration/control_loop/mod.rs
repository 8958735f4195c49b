//! Control loop tests: sources, queue, workers and reconciler together.

use crate::harness::*;
use async_trait::async_trait;
use helm_release_controller::backend::memory::{Operation, StoredRelease};
use helm_release_controller::backend::{BackendError, MemoryBackend, ReleaseState};
use helm_release_controller::config::ControllerConfig;
use helm_release_controller::controller::ShutdownOutcome;
use helm_release_controller::crd::{HelmRelease, HelmReleaseStatus, Phase, Values};
use helm_release_controller::store::{
    EventKind, MemoryStore, ObjectKey, ReleaseEvent, ReleaseStore, StoreError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_release_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());
    let running = start(&store, &backend, test_config());

    let key = create(&store, "web", nginx("15.0.0"));
    assert!(eventually(WAIT, || converged(&store, &key)).await);
    assert_eq!(status(&store, &key).deployed_version.as_deref(), Some("15.0.0"));

    store
        .edit_spec(&key, |spec| spec.version = "15.1.0".to_string())
        .unwrap();
    assert!(
        eventually(WAIT, || converged(&store, &key)
            && status(&store, &key).deployed_version.as_deref() == Some("15.1.0"))
        .await
    );
    assert_eq!(backend.release("demo", "web").unwrap().revision, 2);

    store.request_delete(&key).unwrap();
    assert!(eventually(WAIT, || store.was_erased(&key)).await);
    assert!(backend.release("demo", "web").is_none());

    assert_eq!(backend.count(Operation::Install), 1);
    assert_eq!(backend.count(Operation::Upgrade), 1);
    assert_eq!(backend.count(Operation::Uninstall), 1);
    assert_eq!(running.stop().await, ShutdownOutcome::Drained);
}

#[tokio::test]
async fn test_records_present_at_startup_are_reconciled() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());
    let keys: Vec<ObjectKey> = ["web", "api", "worker"]
        .iter()
        .map(|name| create(&store, name, nginx("15.0.0")))
        .collect();

    let running = start(&store, &backend, test_config());
    assert!(eventually(WAIT, || keys.iter().all(|k| converged(&store, k))).await);
    assert_eq!(backend.count(Operation::Install), 3);
    running.stop().await;
}

#[tokio::test]
async fn test_converged_records_cause_no_backend_writes() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());
    let key = create(&store, "web", nginx("15.0.0"));
    let running = start(&store, &backend, test_config());
    assert!(eventually(WAIT, || converged(&store, &key)).await);

    let mutating = backend.mutating_calls();
    let writes = store.status_writes();
    for _ in 0..20 {
        running.queue.add(key.clone());
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(backend.mutating_calls(), mutating);
    assert_eq!(store.status_writes(), writes);
    running.stop().await;
}

#[tokio::test]
async fn test_at_most_one_reconciliation_per_record() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::with_latency(Duration::from_millis(20)));
    let keys: Vec<ObjectKey> = ["web", "api", "worker"]
        .iter()
        .map(|name| create(&store, name, nginx("15.0.0")))
        .collect();
    let running = start(&store, &backend, test_config());

    for round in 1..=5 {
        for key in &keys {
            store
                .edit_spec(key, |spec| spec.version = format!("15.0.{round}"))
                .unwrap();
            for _ in 0..10 {
                running.queue.add(key.clone());
            }
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    assert!(
        eventually(WAIT, || keys.iter().all(|k| converged(&store, k)
            && status(&store, k).deployed_version.as_deref() == Some("15.0.5")))
        .await
    );
    assert_eq!(backend.peak_in_flight(), 1);
    running.stop().await;
}

#[tokio::test]
async fn test_values_change_upgrades() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());
    let key = create(&store, "web", nginx("15.0.0"));
    let running = start(&store, &backend, test_config());
    assert!(eventually(WAIT, || converged(&store, &key)).await);

    let values: Values = serde_json::from_value(serde_json::json!({
        "replicaCount": 3,
        "service": { "type": "ClusterIP" }
    }))
    .unwrap();
    store
        .edit_spec(&key, |spec| spec.values = Some(values.clone()))
        .unwrap();

    assert!(
        eventually(WAIT, || converged(&store, &key)
            && backend.release("demo", "web").is_some_and(|r| r.values == values))
        .await
    );
    assert_eq!(backend.count(Operation::Upgrade), 1);
    running.stop().await;
}

#[tokio::test]
async fn test_delete_keeps_finalizer_until_uninstalled() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());
    let key = create(&store, "web", nginx("15.0.0"));
    let running = start(&store, &backend, test_config());
    assert!(eventually(WAIT, || converged(&store, &key)).await);

    backend.fail_next(Operation::Uninstall, BackendError::Unavailable("cluster unreachable".to_string()));
    backend.fail_next(Operation::Uninstall, BackendError::Timeout("timed out waiting".to_string()));
    store.request_delete(&key).unwrap();

    assert!(eventually(WAIT, || store.was_erased(&key)).await);
    assert!(backend.release("demo", "web").is_none());
    assert_eq!(backend.count(Operation::Uninstall), 3);
    running.stop().await;
}

#[tokio::test]
async fn test_failed_install_is_retried() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());
    backend.fail_next(Operation::Install, BackendError::ChartNotFound("nginx-15.0.0.tgz".to_string()));
    let key = create(&store, "web", nginx("15.0.0"));
    let running = start(&store, &backend, test_config());

    assert!(eventually(WAIT, || converged(&store, &key)).await);
    assert!(store.phase_history(&key).contains(&Phase::Failed));
    assert!(store
        .events(&key)
        .iter()
        .any(|e| e.kind == EventKind::Warning && e.reason == "ChartNotFound" && e.action == "Install"));
    assert_eq!(backend.count(Operation::Install), 2);
    running.stop().await;
}

#[tokio::test]
async fn test_persistent_failure_waits_for_backoff() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());
    for _ in 0..50 {
        backend.fail_next(
            Operation::Install,
            BackendError::Unavailable("connection refused".to_string()),
        );
    }
    let config = ControllerConfig {
        failure_requeue_interval: Duration::from_secs(30),
        ..test_config()
    };
    let running = start(&store, &backend, config);
    let key = create(&store, "web", nginx("15.0.0"));

    assert!(eventually(WAIT, || status(&store, &key).phase == Some(Phase::Failed)).await);
    let writes = store.status_writes();
    tokio::time::sleep(Duration::from_secs(1)).await;

    // The first failure's own status write may trigger one more pass; after
    // that the record waits out its backoff
    assert!(backend.count(Operation::Install) <= 2);
    assert_eq!(store.status_writes(), writes);
    assert_eq!(
        store.phase_history(&key),
        vec![Phase::Pending, Phase::Installing, Phase::Failed]
    );
    let hr = store.snapshot(&key).unwrap();
    assert_eq!(status(&store, &key).observed_generation, Some(hr.generation()));
    running.stop().await;
}

#[tokio::test]
async fn test_resumes_after_crash_during_install() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());
    let key = create(&store, "web", nginx("15.0.0"));

    // A previous process installed the release and died before recording it
    let hr = store.snapshot(&key).unwrap();
    let hr = store.add_finalizer(&hr).await.unwrap();
    let installing = HelmReleaseStatus {
        phase: Some(Phase::Installing),
        ..HelmReleaseStatus::default()
    };
    store.update_status(&hr, &installing).await.unwrap();
    backend.seed_release(
        "demo",
        "web",
        StoredRelease {
            revision: 1,
            version: "15.0.0".to_string(),
            state: ReleaseState::Deployed,
            values: Values::default(),
        },
    );

    let running = start(&store, &backend, test_config());
    assert!(eventually(WAIT, || converged(&store, &key)).await);
    assert_eq!(status(&store, &key).helm_revision, Some(1));
    assert_eq!(backend.mutating_calls(), 0);
    running.stop().await;
}

#[tokio::test]
async fn test_conflicting_writes_are_retried() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());
    store.inject_conflicts(3);
    let key = create(&store, "web", nginx("15.0.0"));
    let running = start(&store, &backend, test_config());

    assert!(eventually(WAIT, || converged(&store, &key)).await);
    assert_eq!(backend.release("demo", "web").unwrap().revision, 1);
    running.stop().await;
}

/// Store wrapper counting reads per key
struct CountingStore {
    inner: Arc<MemoryStore>,
    reads: AtomicUsize,
    watched: ObjectKey,
}

#[async_trait]
impl ReleaseStore for CountingStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<HelmRelease>, StoreError> {
        if *key == self.watched {
            self.reads.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.get(key).await
    }

    async fn list(&self) -> Result<Vec<HelmRelease>, StoreError> {
        self.inner.list().await
    }

    async fn add_finalizer(&self, hr: &HelmRelease) -> Result<HelmRelease, StoreError> {
        self.inner.add_finalizer(hr).await
    }

    async fn remove_finalizer(&self, hr: &HelmRelease) -> Result<(), StoreError> {
        self.inner.remove_finalizer(hr).await
    }

    async fn update_status(
        &self,
        hr: &HelmRelease,
        status: &HelmReleaseStatus,
    ) -> Result<HelmRelease, StoreError> {
        self.inner.update_status(hr, status).await
    }

    async fn publish_event(&self, hr: &HelmRelease, event: ReleaseEvent) -> Result<(), StoreError> {
        self.inner.publish_event(hr, event).await
    }
}

#[tokio::test]
async fn test_malformed_record_is_dropped_after_bounded_retries() {
    let memory = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());

    // Stored under a key that does not match its own identity
    let ghost = ObjectKey::new("default", "ghost");
    let mut hr = HelmRelease::new("web", nginx("15.0.0"));
    hr.metadata.namespace = Some("default".to_string());
    hr.metadata.generation = Some(1);
    memory.insert_raw(ghost.clone(), hr);

    let store = Arc::new(CountingStore {
        inner: memory.clone(),
        reads: AtomicUsize::new(0),
        watched: ghost.clone(),
    });
    let config = test_config();
    let max_retries = config.max_immediate_retries as usize;
    let running = Running::start(store.clone(), Box::new(memory.change_source()), backend.clone(), config);
    running.queue.add(ghost.clone());

    assert!(eventually(WAIT, || store.reads.load(Ordering::SeqCst) == max_retries + 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.reads.load(Ordering::SeqCst), max_retries + 1);
    assert_eq!(running.queue.num_requeues(&ghost), 0);
    assert_eq!(backend.calls().len(), 0);
    running.stop().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_reconciliation() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::with_latency(Duration::from_millis(300)));
    let key = create(&store, "web", nginx("15.0.0"));
    let running = start(&store, &backend, test_config());

    assert!(eventually(WAIT, || backend.count(Operation::Install) == 1).await);
    assert_eq!(running.stop().await, ShutdownOutcome::Drained);
    assert!(backend.release("demo", "web").is_some());
    assert_eq!(status(&store, &key).phase, Some(Phase::Ready));
}

#[tokio::test]
async fn test_shutdown_aborts_after_grace_period() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::with_latency(Duration::from_secs(10)));
    let key = create(&store, "web", nginx("15.0.0"));
    let mut config = test_config();
    config.shutdown_grace_period = Duration::from_millis(100);
    let running = start(&store, &backend, config);

    assert!(eventually(WAIT, || backend.count(Operation::Install) == 1).await);
    assert_eq!(
        running.stop().await,
        ShutdownOutcome::Aborted { in_flight: 1 }
    );
    // The interrupted pass left the record mid-operation for the next leader
    assert_eq!(status(&store, &key).phase, Some(Phase::Installing));
}

#[tokio::test]
async fn test_reconcile_deadline_is_enforced() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::with_latency(Duration::from_millis(400)));
    let key = create(&store, "web", nginx("15.0.0"));
    let mut config = test_config();
    config.reconcile_timeout = Duration::from_millis(100);
    let running = start(&store, &backend, config);

    // Every install outlives the deadline, so the record never converges
    assert!(eventually(WAIT, || backend.count(Operation::Install) >= 2).await);
    assert_eq!(status(&store, &key).phase, Some(Phase::Installing));
    running.stop().await;
}

//! Leadership gating: only the lease holder reconciles, and leadership
//! moves to a standby replica when the holder stops or loses the lease.

use crate::harness::*;
use helm_release_controller::backend::memory::Operation;
use helm_release_controller::backend::MemoryBackend;
use helm_release_controller::config::LeaseConfig;
use helm_release_controller::controller::reconciler::Reconciler;
use helm_release_controller::controller::server::ServerState;
use helm_release_controller::controller::Controller;
use helm_release_controller::crd::Phase;
use helm_release_controller::leader::{LeaderElector, MemoryLeaseLock};
use helm_release_controller::runtime::{run_controller, RunOutcome};
use helm_release_controller::store::MemoryStore;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

fn lease_config(identity: &str) -> LeaseConfig {
    LeaseConfig {
        lease_name: "helm-release-controller-leader".to_string(),
        lease_namespace: "default".to_string(),
        identity: identity.to_string(),
        lease_duration: Duration::from_millis(600),
        renew_deadline: Duration::from_millis(400),
        retry_period: Duration::from_millis(50),
    }
}

struct Replica {
    state: Arc<ServerState>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<RunOutcome>,
}

impl Replica {
    fn start(
        identity: &str,
        lock: &Arc<MemoryLeaseLock>,
        store: &Arc<MemoryStore>,
        backend: &Arc<MemoryBackend>,
    ) -> Self {
        let config = test_config();
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            backend.clone(),
            config.failure_requeue_interval,
        ));
        let controller = Controller::new(reconciler, config, vec![Box::new(store.change_source())]);
        let elector = Arc::new(LeaderElector::new(lock.clone(), lease_config(identity)));
        let state = Arc::new(ServerState::new(identity));

        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(run_controller(
            controller,
            Some(elector),
            state.clone(),
            async move {
                let _ = stopped.await;
            },
        ));
        Self {
            state,
            stop: Some(stop),
            handle,
        }
    }

    fn is_leader(&self) -> bool {
        self.state.is_leader.load(Ordering::Relaxed)
    }

    async fn stop(mut self) -> RunOutcome {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.handle.await.expect("replica task")
    }
}

#[tokio::test]
async fn test_standby_takes_over_after_leader_stops() {
    let lock = Arc::new(MemoryLeaseLock::new("helm-release-controller-leader"));
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());

    let a = Replica::start("replica-a", &lock, &store, &backend);
    assert!(eventually(WAIT, || a.is_leader()).await);
    let b = Replica::start("replica-b", &lock, &store, &backend);

    let key = create(&store, "web", nginx("15.0.0"));
    assert!(eventually(WAIT, || converged(&store, &key)).await);
    assert!(!b.is_leader());

    assert_eq!(a.stop().await, RunOutcome::Stopped);
    assert!(eventually(WAIT, || b.is_leader()).await);
    assert_eq!(lock.holder().as_deref(), Some("replica-b"));

    store
        .edit_spec(&key, |spec| spec.version = "15.1.0".to_string())
        .unwrap();
    assert!(
        eventually(WAIT, || converged(&store, &key)
            && status(&store, &key).deployed_version.as_deref() == Some("15.1.0"))
        .await
    );

    assert_eq!(backend.count(Operation::Install), 1);
    assert_eq!(backend.count(Operation::Upgrade), 1);
    assert_eq!(backend.peak_in_flight(), 1);
    assert_eq!(b.stop().await, RunOutcome::Stopped);
    assert_eq!(lock.holder(), None);
}

#[tokio::test]
async fn test_lost_lease_stops_reconciling() {
    let lock = Arc::new(MemoryLeaseLock::new("helm-release-controller-leader"));
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());

    let a = Replica::start("replica-a", &lock, &store, &backend);
    assert!(eventually(WAIT, || a.is_leader()).await);

    lock.force_holder("intruder");
    let state = a.state.clone();
    let outcome = tokio::time::timeout(WAIT, a.handle).await.unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::LeadershipLost);
    assert!(!state.is_leader.load(Ordering::Relaxed));
    // A lost lease is not released on the way out
    assert_eq!(lock.holder().as_deref(), Some("intruder"));
}

#[tokio::test]
async fn test_lost_lease_cancels_in_flight_install() {
    let lock = Arc::new(MemoryLeaseLock::new("helm-release-controller-leader"));
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::with_latency(Duration::from_secs(2)));

    let a = Replica::start("replica-a", &lock, &store, &backend);
    assert!(eventually(WAIT, || a.is_leader()).await);
    let key = create(&store, "web", nginx("15.0.0"));
    assert!(eventually(WAIT, || backend.count(Operation::Install) == 1).await);

    lock.force_holder("intruder");
    let lost_at = Instant::now();
    let outcome = tokio::time::timeout(WAIT, a.handle).await.unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::LeadershipLost);
    assert!(lost_at.elapsed() < Duration::from_secs(1));

    // The cancelled install never lands, even once its latency has passed
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(backend.release("demo", "web").is_none());
    assert_eq!(status(&store, &key).phase, Some(Phase::Installing));
}

#[tokio::test]
async fn test_unrenewable_lease_stops_reconciling() {
    let lock = Arc::new(MemoryLeaseLock::new("helm-release-controller-leader"));
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());

    let a = Replica::start("replica-a", &lock, &store, &backend);
    assert!(eventually(WAIT, || a.is_leader()).await);

    lock.set_unavailable(true);
    let outcome = tokio::time::timeout(WAIT, a.handle).await.unwrap().unwrap();
    assert_eq!(outcome, RunOutcome::LeadershipLost);
}

#[tokio::test]
async fn test_standby_never_reconciles() {
    let lock = Arc::new(MemoryLeaseLock::new("helm-release-controller-leader"));
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(MemoryBackend::new());

    // Someone else holds the lease and keeps renewing it
    let holder = Arc::new(LeaderElector::new(lock.clone(), lease_config("holder")));
    assert!(holder.try_acquire_or_renew().await.unwrap());
    let renewer = holder.clone();
    let renewing = tokio::spawn(async move {
        loop {
            let _ = renewer.try_acquire_or_renew().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    let b = Replica::start("replica-b", &lock, &store, &backend);
    create(&store, "web", nginx("15.0.0"));
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(!b.is_leader());
    assert!(backend.calls().is_empty());
    assert_eq!(b.stop().await, RunOutcome::Stopped);
    renewing.abort();
}

//! # Leader Election
//!
//! At most one replica drives the control loop. Replicas compete for a
//! lease; the holder renews it every retry period and steps down when no
//! renewal has succeeded within the renew deadline.
//!
//! Expiry of someone else's lease is judged on the local monotonic clock:
//! a lease counts as expired once its record has not changed for a full
//! lease duration since this replica first saw it. Wall-clock skew between
//! replicas therefore does not matter.

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeLeaseLock;
pub use memory::MemoryLeaseLock;

use crate::config::LeaseConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// The lease changed since it was read
    #[error("lease {0} was modified concurrently")]
    Conflict(String),

    /// Another replica created the lease first
    #[error("lease {0} already exists")]
    AlreadyExists(String),

    /// The stored lease could not be interpreted
    #[error("invalid lease {name}: {message}")]
    Invalid { name: String, message: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Contents of the lease, independent of where it is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// `None` once the holder resigned
    pub holder: Option<String>,
    pub lease_duration: Duration,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    pub transitions: i32,
    /// Opaque version used for conditional replace; set by the lock
    pub version: Option<String>,
}

impl LeaseRecord {
    fn held_by(&self, identity: &str) -> bool {
        self.holder.as_deref() == Some(identity)
    }

    /// Whether two reads show the same lease state
    fn same_term(&self, other: &LeaseRecord) -> bool {
        self.holder == other.holder
            && self.renewed_at == other.renewed_at
            && self.transitions == other.transitions
            && self.version == other.version
    }
}

/// Storage for the lease record
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Current record, or `None` if the lease does not exist yet
    async fn get(&self) -> Result<Option<LeaseRecord>, LeaderElectionError>;

    /// Create the lease; `AlreadyExists` if another replica won the race
    async fn create(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaderElectionError>;

    /// Replace the lease if its version still equals `record.version`;
    /// `Conflict` otherwise
    async fn replace(&self, record: &LeaseRecord) -> Result<LeaseRecord, LeaderElectionError>;

    /// Name used in logs
    fn describe(&self) -> String;
}

#[derive(Debug)]
struct Observation {
    record: LeaseRecord,
    at: Instant,
}

/// Lease-based leader elector
pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    config: LeaseConfig,
    observed: Mutex<Option<Observation>>,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("lease", &self.lock.describe())
            .field("identity", &self.config.identity)
            .finish_non_exhaustive()
    }
}

impl LeaderElector {
    pub fn new(lock: Arc<dyn LeaseLock>, config: LeaseConfig) -> Self {
        Self {
            lock,
            config,
            observed: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Remember `record`, keeping the original observation time while the
    /// record is unchanged
    fn observe(&self, record: &LeaseRecord) {
        let mut observed = self
            .observed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let unchanged = observed
            .as_ref()
            .is_some_and(|o| o.record.same_term(record));
        if !unchanged {
            *observed = Some(Observation {
                record: record.clone(),
                at: Instant::now(),
            });
        }
    }

    fn observed_expired(&self, record: &LeaseRecord) -> bool {
        let observed = self
            .observed
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match observed.as_ref() {
            Some(o) if o.record.same_term(record) => o.at.elapsed() >= record.lease_duration,
            _ => false,
        }
    }

    /// One acquisition or renewal attempt. `Ok(true)` while this replica
    /// holds the lease afterwards.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let now = Utc::now();
        let identity = self.config.identity.as_str();

        let Some(current) = self.lock.get().await? else {
            let record = LeaseRecord {
                holder: Some(identity.to_string()),
                lease_duration: self.config.lease_duration,
                acquired_at: now,
                renewed_at: now,
                transitions: 0,
                version: None,
            };
            return match self.lock.create(&record).await {
                Ok(created) => {
                    self.observe(&created);
                    Ok(true)
                }
                Err(LeaderElectionError::AlreadyExists(_)) => Ok(false),
                Err(e) => Err(e),
            };
        };

        self.observe(&current);
        let held_by_me = current.held_by(identity);
        if !held_by_me && current.holder.is_some() && !self.observed_expired(&current) {
            return Ok(false);
        }

        let next = LeaseRecord {
            holder: Some(identity.to_string()),
            lease_duration: self.config.lease_duration,
            acquired_at: if held_by_me { current.acquired_at } else { now },
            renewed_at: now,
            transitions: if held_by_me {
                current.transitions
            } else {
                current.transitions.saturating_add(1)
            },
            version: current.version.clone(),
        };
        match self.lock.replace(&next).await {
            Ok(replaced) => {
                if !held_by_me {
                    info!(
                        "Acquired lease {} (previous holder: {})",
                        self.lock.describe(),
                        current.holder.as_deref().unwrap_or("<none>")
                    );
                }
                self.observe(&replaced);
                Ok(true)
            }
            Err(LeaderElectionError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Block until this replica holds the lease
    pub async fn campaign(&self) {
        info!(
            "Campaigning for lease {} as {}",
            self.lock.describe(),
            self.config.identity
        );
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!("Became leader as {}", self.config.identity);
                    return;
                }
                Ok(false) => debug!("Lease {} is held by another replica", self.lock.describe()),
                Err(e) => warn!("Failed to acquire lease {}: {}", self.lock.describe(), e),
            }
            tokio::time::sleep(self.config.retry_period).await;
        }
    }

    /// Renew the lease every retry period until leadership is lost.
    ///
    /// Sends `true` on start and `false` once leadership is lost: another
    /// replica holds the lease, or no renewal succeeded within the renew
    /// deadline. Returns early if every receiver is gone.
    pub async fn run_renewal(&self, leading: watch::Sender<bool>) {
        leading.send_replace(true);
        let mut last_renewal = Instant::now();

        loop {
            tokio::select! {
                () = tokio::time::sleep(self.config.retry_period) => {}
                () = leading.closed() => return,
            }

            // Bound each attempt so a hung API call still trips the deadline
            let remaining = self
                .config
                .renew_deadline
                .saturating_sub(last_renewal.elapsed());
            let attempt = tokio::time::timeout(remaining, self.try_acquire_or_renew()).await;
            match attempt {
                Ok(Ok(true)) => {
                    last_renewal = Instant::now();
                    continue;
                }
                Ok(Ok(false)) => {
                    warn!("Lease {} was taken over by another replica", self.lock.describe());
                    break;
                }
                Ok(Err(e)) => warn!("Failed to renew lease {}: {}", self.lock.describe(), e),
                Err(_) => warn!("Renewal of lease {} timed out", self.lock.describe()),
            }

            if last_renewal.elapsed() >= self.config.renew_deadline {
                warn!(
                    "No successful renewal of lease {} within {}s",
                    self.lock.describe(),
                    self.config.renew_deadline.as_secs()
                );
                break;
            }
        }

        leading.send_replace(false);
    }

    /// Release the lease so another replica can take over without waiting
    /// for expiry. A no-op if this replica is not the holder.
    pub async fn resign(&self) -> Result<(), LeaderElectionError> {
        let Some(current) = self.lock.get().await? else {
            return Ok(());
        };
        if !current.held_by(&self.config.identity) {
            return Ok(());
        }
        let released = LeaseRecord {
            holder: None,
            renewed_at: Utc::now(),
            ..current
        };
        self.lock.replace(&released).await?;
        info!("Released lease {}", self.lock.describe());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(identity: &str) -> LeaseConfig {
        LeaseConfig {
            lease_name: "test-lease".to_string(),
            lease_namespace: "default".to_string(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    fn elector(lock: &Arc<MemoryLeaseLock>, identity: &str) -> LeaderElector {
        LeaderElector::new(lock.clone(), config(identity))
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_candidate_acquires() {
        let lock = Arc::new(MemoryLeaseLock::new("test-lease"));
        let a = elector(&lock, "a");
        assert!(a.try_acquire_or_renew().await.unwrap());
        assert_eq!(lock.holder().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_lease_blocks_others_until_expiry() {
        let lock = Arc::new(MemoryLeaseLock::new("test-lease"));
        let a = elector(&lock, "a");
        let b = elector(&lock, "b");
        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!b.try_acquire_or_renew().await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(b.try_acquire_or_renew().await.unwrap());
        assert_eq!(lock.holder().as_deref(), Some("b"));
        assert_eq!(lock.transitions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_lease_alive() {
        let lock = Arc::new(MemoryLeaseLock::new("test-lease"));
        let a = elector(&lock, "a");
        let b = elector(&lock, "b");
        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(5)).await;
            assert!(a.try_acquire_or_renew().await.unwrap());
            assert!(!b.try_acquire_or_renew().await.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resign_hands_over_immediately() {
        let lock = Arc::new(MemoryLeaseLock::new("test-lease"));
        let a = elector(&lock, "a");
        let b = elector(&lock, "b");
        assert!(a.try_acquire_or_renew().await.unwrap());
        a.resign().await.unwrap();
        assert_eq!(lock.holder(), None);
        assert!(b.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resign_by_non_holder_is_noop() {
        let lock = Arc::new(MemoryLeaseLock::new("test-lease"));
        let a = elector(&lock, "a");
        let b = elector(&lock, "b");
        assert!(a.try_acquire_or_renew().await.unwrap());
        b.resign().await.unwrap();
        assert_eq!(lock.holder().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_signals_loss_on_takeover() {
        let lock = Arc::new(MemoryLeaseLock::new("test-lease"));
        let a = Arc::new(elector(&lock, "a"));
        assert!(a.try_acquire_or_renew().await.unwrap());

        let (tx, mut rx) = watch::channel(false);
        let renewer = a.clone();
        let handle = tokio::spawn(async move { renewer.run_renewal(tx).await });

        rx.wait_for(|leading| *leading).await.unwrap();
        lock.force_holder("intruder");
        rx.wait_for(|leading| !*leading).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_signals_loss_after_deadline() {
        let lock = Arc::new(MemoryLeaseLock::new("test-lease"));
        let a = Arc::new(elector(&lock, "a"));
        assert!(a.try_acquire_or_renew().await.unwrap());

        let (tx, mut rx) = watch::channel(false);
        let renewer = a.clone();
        let handle = tokio::spawn(async move { renewer.run_renewal(tx).await });
        rx.wait_for(|leading| *leading).await.unwrap();

        lock.set_unavailable(true);
        let started = Instant::now();
        rx.wait_for(|leading| !*leading).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(8));
        assert!(started.elapsed() <= Duration::from_secs(12));
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_campaign_waits_for_resignation() {
        let lock = Arc::new(MemoryLeaseLock::new("test-lease"));
        let a = elector(&lock, "a");
        let b = Arc::new(elector(&lock, "b"));
        assert!(a.try_acquire_or_renew().await.unwrap());

        let campaigner = b.clone();
        let campaign = tokio::spawn(async move { campaigner.campaign().await });
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!campaign.is_finished());

        a.resign().await.unwrap();
        campaign.await.unwrap();
        assert_eq!(lock.holder().as_deref(), Some("b"));
    }
}

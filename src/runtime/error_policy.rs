//! # Error Policy
//!
//! Requeue decisions for reconciliation results, and classification of
//! watch stream errors.

use crate::constants;
use crate::controller::reconciler::{ReconcileOutcome, ReconcilerError};
use crate::observability;
use crate::queue::WorkQueue;
use crate::store::ObjectKey;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn, Instrument};

/// How a key is re-queued after a reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueDecision {
    /// Converged; reset retry state
    Forget,
    /// Deliver again after a delay
    After(Duration),
    /// Deliver again right away
    Immediate,
    /// Retry with the bounded immediate-retry budget
    RateLimited,
}

/// Decide how to re-queue a key given a reconciliation result
pub fn requeue_decision(
    result: &Result<ReconcileOutcome, ReconcilerError>,
    failure_requeue: Duration,
) -> RequeueDecision {
    match result {
        Ok(ReconcileOutcome::Done) => RequeueDecision::Forget,
        Ok(ReconcileOutcome::Requeue(delay)) => RequeueDecision::After(*delay),
        // Re-read and redo the whole pass against the newer record
        Err(ReconcilerError::Conflict(_)) => RequeueDecision::Immediate,
        Err(ReconcilerError::InvalidObject(_)) => RequeueDecision::RateLimited,
        Err(ReconcilerError::Store(_) | ReconcilerError::DeadlineExceeded(_)) => {
            RequeueDecision::After(failure_requeue)
        }
    }
}

/// Apply a reconciliation result to the work queue
///
/// Logs and counts the result, then schedules the key per
/// [`requeue_decision`]. Must be called before `done` so a re-queue issued
/// here is delivered after the worker releases the key.
pub fn handle_reconciliation_result(
    queue: &Arc<WorkQueue<ObjectKey>>,
    key: &ObjectKey,
    result: &Result<ReconcileOutcome, ReconcilerError>,
    failure_requeue: Duration,
) {
    if let Err(e) = result {
        match e {
            ReconcilerError::Conflict(_) => debug!("Reconciliation of {} hit a conflict: {}", key, e),
            _ => error!("Reconciliation error for {}: {}", key, e),
        }
        observability::metrics::increment_reconciliation_errors(e.kind());
    }

    match requeue_decision(result, failure_requeue) {
        RequeueDecision::Forget => {
            queue.forget(key);
        }
        RequeueDecision::After(delay) => {
            let reason = if result.is_ok() { "failure-backoff" } else { "error-backoff" };
            info!(
                "Requeueing {} in {}s (trigger source: {})",
                key,
                delay.as_secs(),
                reason
            );
            observability::metrics::increment_requeues_total(reason);
            queue.add_after(key.clone(), delay);
        }
        RequeueDecision::Immediate => {
            observability::metrics::increment_requeues_total("conflict");
            queue.add(key.clone());
        }
        RequeueDecision::RateLimited => {
            if queue.add_rate_limited(key.clone()) {
                observability::metrics::increment_requeues_total("rate-limited");
            } else {
                error!(
                    "Dropping {} after repeated failures; it will be picked up again on its next change",
                    key
                );
                observability::metrics::increment_dropped_keys();
            }
        }
    }
}

/// Class of a watch stream error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorClass {
    Unauthorized,
    Expired,
    Throttled,
    NotFound,
    Other,
}

impl WatchErrorClass {
    /// Classify by the error text (status code or API reason)
    pub fn classify(error_string: &str) -> Self {
        let is_401 = error_string.contains("401")
            || error_string.contains("Unauthorized")
            || error_string.contains("Forbidden");
        let is_410 = error_string.contains("410")
            || error_string.contains("too old resource version")
            || error_string.contains("Expired")
            || error_string.contains("Gone");
        let is_429 = error_string.contains("429")
            || error_string.contains("storage is (re)initializing")
            || error_string.contains("TooManyRequests");
        let is_not_found = error_string.contains("ObjectNotFound")
            || (error_string.contains("404") && error_string.contains("not found"));

        if is_401 {
            WatchErrorClass::Unauthorized
        } else if is_410 {
            WatchErrorClass::Expired
        } else if is_429 {
            WatchErrorClass::Throttled
        } else if is_not_found {
            WatchErrorClass::NotFound
        } else {
            WatchErrorClass::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WatchErrorClass::Unauthorized => "unauthorized",
            WatchErrorClass::Expired => "expired",
            WatchErrorClass::Throttled => "throttled",
            WatchErrorClass::NotFound => "not-found",
            WatchErrorClass::Other => "other",
        }
    }
}

/// Handle a watch stream error: log it with diagnostics and wait as
/// appropriate before the watcher retries.
pub async fn handle_watch_stream_error(
    error_string: &str,
    backoff: &Arc<AtomicU64>,
    max_backoff_ms: u64,
) -> WatchErrorClass {
    let error_span = tracing::warn_span!("controller.watch.error", error = %error_string);
    wait_after_watch_error(error_string, backoff, max_backoff_ms)
        .instrument(error_span)
        .await
}

async fn wait_after_watch_error(
    error_string: &str,
    backoff: &Arc<AtomicU64>,
    max_backoff_ms: u64,
) -> WatchErrorClass {
    let class = WatchErrorClass::classify(error_string);
    match class {
        WatchErrorClass::Unauthorized => {
            error!("Watch authentication failed - RBAC may have been revoked or token expired");
            error!("Diagnostics:");
            error!("   1. Verify the ClusterRole grants list/watch on helmreleases.helm.releases.io");
            error!("      kubectl auth can-i watch helmreleases.helm.releases.io --as=system:serviceaccount:<namespace>:helm-release-controller");
            error!("   2. Verify the ClusterRoleBinding still binds the ServiceAccount");
            error!("   3. If RBAC was recently changed, restart the controller pod");
            warn!(
                "Waiting {}s before retrying watch (RBAC may need time to propagate)...",
                constants::DEFAULT_WATCH_RESTART_DELAY_SECS
            );
            tokio::time::sleep(Duration::from_secs(constants::DEFAULT_WATCH_RESTART_DELAY_SECS)).await;
        }
        WatchErrorClass::Expired => {
            warn!("Watch resource version expired (410), watch will relist");
        }
        WatchErrorClass::Throttled => {
            let current_backoff = backoff.load(Ordering::Relaxed);
            warn!(
                "API server throttling or reinitializing (429), backing off for {}ms...",
                current_backoff
            );
            tokio::time::sleep(Duration::from_millis(current_backoff)).await;
            let new_backoff = current_backoff.saturating_mul(2).min(max_backoff_ms);
            backoff.store(new_backoff, Ordering::Relaxed);
        }
        WatchErrorClass::NotFound => {
            warn!("Resource not found (likely deleted), continuing watch...");
        }
        WatchErrorClass::Other => {
            error!("Watch stream error: {}", error_string);
            tokio::time::sleep(Duration::from_secs(constants::DEFAULT_WATCH_RESTART_DELAY_SECS)).await;
        }
    }

    observability::metrics::increment_watch_restarts(class.as_str());
    class
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RetryPolicy;
    use crate::store::StoreError;

    const BACKOFF: Duration = Duration::from_secs(30);

    #[test]
    fn test_requeue_decisions() {
        assert_eq!(
            requeue_decision(&Ok(ReconcileOutcome::Done), BACKOFF),
            RequeueDecision::Forget
        );
        assert_eq!(
            requeue_decision(&Ok(ReconcileOutcome::Requeue(Duration::from_secs(5))), BACKOFF),
            RequeueDecision::After(Duration::from_secs(5))
        );
        assert_eq!(
            requeue_decision(&Err(ReconcilerError::Conflict("k".to_string())), BACKOFF),
            RequeueDecision::Immediate
        );
        assert_eq!(
            requeue_decision(&Err(ReconcilerError::InvalidObject("k".to_string())), BACKOFF),
            RequeueDecision::RateLimited
        );
        assert_eq!(
            requeue_decision(
                &Err(ReconcilerError::Store(StoreError::Other("down".to_string()))),
                BACKOFF
            ),
            RequeueDecision::After(BACKOFF)
        );
        assert_eq!(
            requeue_decision(&Err(ReconcilerError::DeadlineExceeded(BACKOFF)), BACKOFF),
            RequeueDecision::After(BACKOFF)
        );
    }

    #[test]
    fn test_watch_error_classification() {
        assert_eq!(
            WatchErrorClass::classify("ApiError: Unauthorized (ErrorResponse { code: 401 })"),
            WatchErrorClass::Unauthorized
        );
        assert_eq!(
            WatchErrorClass::classify("too old resource version: 123 (456)"),
            WatchErrorClass::Expired
        );
        assert_eq!(
            WatchErrorClass::classify("storage is (re)initializing"),
            WatchErrorClass::Throttled
        );
        assert_eq!(
            WatchErrorClass::classify("ObjectNotFound"),
            WatchErrorClass::NotFound
        );
        assert_eq!(
            WatchErrorClass::classify("connection reset by peer"),
            WatchErrorClass::Other
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_backoff_doubles_up_to_max() {
        let backoff = Arc::new(AtomicU64::new(1000));
        handle_watch_stream_error("429 TooManyRequests", &backoff, 3000).await;
        assert_eq!(backoff.load(Ordering::Relaxed), 2000);
        handle_watch_stream_error("429 TooManyRequests", &backoff, 3000).await;
        assert_eq!(backoff.load(Ordering::Relaxed), 3000);
    }

    #[tokio::test]
    async fn test_done_forgets_retry_budget() {
        let queue = WorkQueue::new(RetryPolicy::default());
        let key = ObjectKey::new("default", "web");
        queue.add_rate_limited(key.clone());
        assert_eq!(queue.num_requeues(&key), 1);
        handle_reconciliation_result(&queue, &key, &Ok(ReconcileOutcome::Done), BACKOFF);
        assert_eq!(queue.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn test_conflict_requeues_immediately() {
        let queue = WorkQueue::new(RetryPolicy::default());
        let key = ObjectKey::new("default", "web");
        handle_reconciliation_result(
            &queue,
            &key,
            &Err(ReconcilerError::Conflict(key.to_string())),
            BACKOFF,
        );
        assert_eq!(queue.len(), 1);
    }
}

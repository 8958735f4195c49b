//! # Reconciliation Settings
//!
//! Worker pool, deadlines and retry policy.

use super::{env_duration_or_default, env_string, env_var_or_default};
use crate::queue::RetryPolicy;
use std::time::Duration;

/// Control loop configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Concurrent reconciliation workers
    pub workers: usize,
    /// Deadline for a single reconciliation
    pub reconcile_timeout: Duration,
    /// Fixed backoff after a failed reconciliation
    pub failure_requeue_interval: Duration,
    /// Time allowed for in-flight reconciliations on shutdown
    pub shutdown_grace_period: Duration,
    /// Consecutive rate-limited retries before a key is dropped
    pub max_immediate_retries: u32,
    pub immediate_retry_delay: Duration,
    /// Capacity of the change notification channel
    pub watch_channel_capacity: usize,
    /// Watch a single namespace instead of the whole cluster
    pub watch_namespace: Option<String>,
    /// Timeout handed to each helm invocation
    pub helm_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            workers: DEFAULT_WORKERS,
            reconcile_timeout: Duration::from_secs(DEFAULT_RECONCILE_TIMEOUT_SECS),
            failure_requeue_interval: Duration::from_secs(DEFAULT_FAILURE_REQUEUE_SECS),
            shutdown_grace_period: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_PERIOD_SECS),
            max_immediate_retries: DEFAULT_MAX_IMMEDIATE_RETRIES,
            immediate_retry_delay: Duration::from_millis(DEFAULT_IMMEDIATE_RETRY_DELAY_MS),
            watch_channel_capacity: DEFAULT_WATCH_CHANNEL_CAPACITY,
            watch_namespace: None,
            helm_timeout: Duration::from_secs(DEFAULT_HELM_TIMEOUT_SECS),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workers: env_var_or_default("WORKERS", defaults.workers).max(1),
            reconcile_timeout: env_duration_or_default(
                "RECONCILE_TIMEOUT",
                defaults.reconcile_timeout,
            ),
            failure_requeue_interval: env_duration_or_default(
                "FAILURE_REQUEUE_INTERVAL",
                defaults.failure_requeue_interval,
            ),
            shutdown_grace_period: env_duration_or_default(
                "SHUTDOWN_GRACE_PERIOD",
                defaults.shutdown_grace_period,
            ),
            max_immediate_retries: env_var_or_default(
                "MAX_IMMEDIATE_RETRIES",
                defaults.max_immediate_retries,
            ),
            immediate_retry_delay: defaults.immediate_retry_delay,
            watch_channel_capacity: env_var_or_default(
                "WATCH_CHANNEL_CAPACITY",
                defaults.watch_channel_capacity,
            )
            .max(1),
            watch_namespace: env_string("WATCH_NAMESPACE"),
            helm_timeout: env_duration_or_default("HELM_TIMEOUT", defaults.helm_timeout),
        }
    }

    /// Work queue retry policy derived from this configuration
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_immediate_retries: self.max_immediate_retries,
            immediate_retry_delay: self.immediate_retry_delay,
        }
    }
}

//! # Constants
//!
//! Default values for configuration. Each can be overridden through the
//! environment (see `config`).

/// Field manager and event reporter name
pub const FIELD_MANAGER: &str = "helm-release-controller";

/// Default port of the metrics, probe and leader status server
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Seconds to wait for the HTTP server to bind
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Milliseconds between server readiness polls during startup
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;

/// Reconciliation workers
pub const DEFAULT_WORKERS: usize = 4;

/// Deadline for a single reconciliation
pub const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 300;

/// Fixed backoff after a failed reconciliation
pub const DEFAULT_FAILURE_REQUEUE_SECS: u64 = 30;

/// Time allowed for in-flight reconciliations on shutdown
pub const DEFAULT_SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

/// Consecutive rate-limited retries before a key is dropped
pub const DEFAULT_MAX_IMMEDIATE_RETRIES: u32 = 5;

/// Delay before each rate-limited retry
pub const DEFAULT_IMMEDIATE_RETRY_DELAY_MS: u64 = 500;

/// Capacity of the channel between change sources and the work queue
pub const DEFAULT_WATCH_CHANNEL_CAPACITY: usize = 256;

/// Delay before restarting a failed watch
pub const DEFAULT_WATCH_RESTART_DELAY_SECS: u64 = 5;

/// Upper bound for the watch backoff on 429 responses
pub const DEFAULT_WATCH_MAX_BACKOFF_MS: u64 = 30_000;

/// Timeout passed to each helm invocation
pub const DEFAULT_HELM_TIMEOUT_SECS: u64 = 240;

/// Lease name used for leader election
pub const DEFAULT_LEASE_NAME: &str = "helm-release-controller-leader";

/// Namespace holding the lease when `POD_NAMESPACE` is unset
pub const DEFAULT_LEASE_NAMESPACE: &str = "default";

pub const DEFAULT_LEASE_DURATION_SECS: u64 = 15;

pub const DEFAULT_RENEW_DEADLINE_SECS: u64 = 10;

pub const DEFAULT_RETRY_PERIOD_SECS: u64 = 2;

//! # Runtime Metrics
//!
//! Work queue depth, dropped keys, watch restarts and leadership.

use crate::observability::metrics::registry::REGISTRY;
use anyhow::Result;
use prometheus::{IntCounter, IntCounterVec, IntGauge};
use std::sync::LazyLock;

static QUEUE_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "helm_release_queue_depth",
        "Keys waiting in the work queue",
    )
    .expect("Failed to create QUEUE_DEPTH metric - this should never happen")
});

static DROPPED_KEYS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "helm_release_dropped_keys_total",
        "Keys dropped after exhausting their immediate retries",
    )
    .expect("Failed to create DROPPED_KEYS_TOTAL metric - this should never happen")
});

static WATCH_RESTARTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "helm_release_watch_restarts_total",
            "Watch stream restarts by error class",
        ),
        &["reason"],
    )
    .expect("Failed to create WATCH_RESTARTS_TOTAL metric - this should never happen")
});

static IS_LEADER: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "helm_release_is_leader",
        "1 while this replica holds the leader lease",
    )
    .expect("Failed to create IS_LEADER metric - this should never happen")
});

pub(crate) fn register_runtime_metrics() -> Result<()> {
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(DROPPED_KEYS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WATCH_RESTARTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(IS_LEADER.clone()))?;
    Ok(())
}

pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(i64::try_from(depth).unwrap_or(i64::MAX));
}

pub fn increment_dropped_keys() {
    DROPPED_KEYS_TOTAL.inc();
}

pub fn increment_watch_restarts(reason: &str) {
    WATCH_RESTARTS_TOTAL.with_label_values(&[reason]).inc();
}

pub fn set_leader(is_leader: bool) {
    IS_LEADER.set(i64::from(is_leader));
}

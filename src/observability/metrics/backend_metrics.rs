//! # Backend Metrics
//!
//! Release backend operations by operation and result.

use crate::observability::metrics::registry::REGISTRY;
use anyhow::Result;
use prometheus::IntCounterVec;
use std::sync::LazyLock;

static BACKEND_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "helm_release_backend_operations_total",
            "Total number of release backend operations",
        ),
        &["operation", "result"],
    )
    .expect("Failed to create BACKEND_OPERATIONS_TOTAL metric - this should never happen")
});

pub(crate) fn register_backend_metrics() -> Result<()> {
    REGISTRY.register(Box::new(BACKEND_OPERATIONS_TOTAL.clone()))?;
    Ok(())
}

/// Count one backend call. `result` is `success` or a failure reason.
pub fn record_backend_operation(operation: &str, result: &str) {
    BACKEND_OPERATIONS_TOTAL
        .with_label_values(&[operation, result])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_backend_operation() {
        let before = BACKEND_OPERATIONS_TOTAL
            .with_label_values(&["test-op", "success"])
            .get();
        record_backend_operation("test-op", "success");
        let after = BACKEND_OPERATIONS_TOTAL
            .with_label_values(&["test-op", "success"])
            .get();
        assert_eq!(after, before + 1);
    }
}

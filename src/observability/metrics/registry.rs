//! # Metrics Registry
//!
//! Prometheus metrics registry setup and registration.

use anyhow::Result;
use prometheus::{Encoder, Registry, TextEncoder};
use std::sync::LazyLock;

/// Global Prometheus metrics registry
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Register all metrics with the Prometheus registry
///
/// Prometheus Registry::register() takes ownership (Box<dyn Collector>),
/// so the metrics are cloned. Prometheus metrics internally use Arc, so the
/// clones share state with the statics.
#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    super::controller_metrics::register_controller_metrics()?;
    super::backend_metrics::register_backend_metrics()?;
    super::runtime_metrics::register_runtime_metrics()?;
    Ok(())
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

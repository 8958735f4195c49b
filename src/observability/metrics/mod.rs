//! # Metrics Module
//!
//! Prometheus metrics for monitoring the controller, organized by responsibility.
//!
//! ## Sub-modules
//!
//! - `registry` - Metrics registry setup, registration and text export
//! - `controller_metrics` - Reconciliations, requeues and phase transitions
//! - `backend_metrics` - Release backend operations
//! - `runtime_metrics` - Work queue, watch and leader election state

pub mod backend_metrics;
pub mod controller_metrics;
pub mod registry;
pub mod runtime_metrics;

pub use backend_metrics::*;
pub use controller_metrics::*;
pub use registry::*;
pub use runtime_metrics::*;

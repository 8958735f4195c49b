//! # Runtime Module
//!
//! Runtime components for the Helm Release Controller: initialization,
//! leadership supervision and error handling.

pub mod error_policy;
pub mod initialization;
pub mod supervisor;

pub use initialization::{initialize, InitializationResult};
pub use supervisor::{run_controller, shutdown_signal, RunOutcome};

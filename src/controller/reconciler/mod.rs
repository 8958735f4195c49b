//! # Reconciler
//!
//! Drives HelmRelease records toward their spec through the release backend.

pub mod reconcile;
pub mod status;
pub mod types;
pub mod validation;

pub use reconcile::reconcile;
pub use types::{ReconcileOutcome, Reconciler, ReconcilerError};

//! # Helm Release Controller
//!
//! A Kubernetes controller that keeps Helm releases in line with
//! `HelmRelease` resources.
//!
//! ## Overview
//!
//! 1. **Watching HelmRelease resources** - every change enqueues the record's key
//! 2. **Reconciling** - a worker installs, upgrades or uninstalls the release
//!    through the `helm` CLI and records the outcome in the status subresource
//! 3. **Finalizers** - a release is uninstalled before its resource is erased
//! 4. **Leader election** - one replica reconciles, the others stand by
//!
//! Reconciliation is level-triggered and idempotent: any pass may be repeated,
//! including after a crash between a Helm operation and the status write.

pub mod backend;
pub mod cli;
pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod leader;
pub mod observability;
pub mod queue;
pub mod runtime;
pub mod store;

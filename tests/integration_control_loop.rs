//! Control Loop Integration Tests
//!
//! Run the full loop (change source, work queue, worker pool, reconciler)
//! against the in-memory store and backend. No cluster or helm binary is
//! needed.
//!
//! Run with: `cargo test --test integration_control_loop`

#[path = "integration/harness.rs"]
mod harness;

#[path = "integration/control_loop/mod.rs"]
mod control_loop;

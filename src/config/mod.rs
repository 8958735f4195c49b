//! # Controller Configuration
//!
//! Controller-level configuration loaded from environment variables.
//!
//! All configuration has defaults (see `constants`) and can be overridden via
//! environment variables. Durations use the Kubernetes short form (`30s`,
//! `5m`, `1h`).

mod controller;
mod lease;
mod server;

pub use controller::ControllerConfig;
pub use lease::LeaseConfig;
pub use server::ServerConfig;

use crate::controller::reconciler::validation::parse_kubernetes_duration;
use std::time::Duration;
use tracing::warn;

/// Load configuration from environment variables with defaults
pub fn load_config() -> (ControllerConfig, ServerConfig, LeaseConfig) {
    (
        ControllerConfig::from_env(),
        ServerConfig::from_env(),
        LeaseConfig::from_env(),
    )
}

/// Read environment variable or return default value
fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read a Kubernetes duration from the environment, falling back to `default`
/// when unset or malformed
fn env_duration_or_default(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => match parse_kubernetes_duration(&raw) {
            Ok(duration) => duration,
            Err(e) => {
                warn!("Ignoring {}={}: {}", key, raw, e);
                default
            }
        },
        _ => default,
    }
}

/// Read a non-empty string from the environment
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

//! # Server Configuration
//!
//! HTTP server settings loaded from environment variables.

use super::env_var_or_default;
use std::net::SocketAddr;

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address for metrics, probes and the leader status page
    pub bind_address: SocketAddr,
    /// Server startup timeout (seconds)
    /// How long to wait for server to be ready before giving up
    pub startup_timeout_secs: u64,
    /// Server readiness poll interval (milliseconds)
    pub poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_METRICS_PORT)),
            startup_timeout_secs: DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_SERVER_POLL_INTERVAL_MS,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// `METRICS_PORT` replaces the port of the default bind address; the
    /// `--ui-bind-address` flag overrides both.
    pub fn from_env() -> Self {
        use crate::constants::*;
        let port = env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT);
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], port)),
            startup_timeout_secs: env_var_or_default(
                "SERVER_STARTUP_TIMEOUT_SECS",
                DEFAULT_SERVER_STARTUP_TIMEOUT_SECS,
            ),
            poll_interval_ms: env_var_or_default(
                "SERVER_POLL_INTERVAL_MS",
                DEFAULT_SERVER_POLL_INTERVAL_MS,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_binds_all_interfaces() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address.to_string(), "0.0.0.0:8080");
        assert_eq!(config.startup_timeout_secs, 10);
    }
}

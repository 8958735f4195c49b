//! # Leader Election Settings

use super::{env_duration_or_default, env_string};
use std::time::Duration;

/// Lease parameters for leader election
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    pub lease_name: String,
    pub lease_namespace: String,
    /// Holder identity written into the lease
    pub identity: String,
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// Leadership is given up when no renewal succeeded for this long
    pub renew_deadline: Duration,
    /// Interval between acquisition attempts and renewals
    pub retry_period: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            lease_namespace: DEFAULT_LEASE_NAMESPACE.to_string(),
            identity: default_identity(),
            lease_duration: Duration::from_secs(DEFAULT_LEASE_DURATION_SECS),
            renew_deadline: Duration::from_secs(DEFAULT_RENEW_DEADLINE_SECS),
            retry_period: Duration::from_secs(DEFAULT_RETRY_PERIOD_SECS),
        }
    }
}

impl LeaseConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut config = Self {
            lease_name: env_string("LEASE_NAME").unwrap_or(defaults.lease_name),
            lease_namespace: env_string("POD_NAMESPACE").unwrap_or(defaults.lease_namespace),
            identity: defaults.identity,
            lease_duration: env_duration_or_default("LEASE_DURATION", defaults.lease_duration),
            renew_deadline: env_duration_or_default("RENEW_DEADLINE", defaults.renew_deadline),
            retry_period: env_duration_or_default("RETRY_PERIOD", defaults.retry_period),
        };
        // A deadline at or past the lease duration would let two holders overlap
        if config.renew_deadline >= config.lease_duration {
            config.renew_deadline = config.lease_duration.mul_f64(2.0 / 3.0);
        }
        config
    }
}

/// `POD_NAME`, else the hostname, with a random suffix so restarts of the
/// same pod never reuse an identity
fn default_identity() -> String {
    let base = env_string("POD_NAME")
        .or_else(|| env_string("HOSTNAME"))
        .unwrap_or_else(|| "helm-release-controller".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", base, &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LeaseConfig::default();
        assert_eq!(config.lease_duration, Duration::from_secs(15));
        assert_eq!(config.renew_deadline, Duration::from_secs(10));
        assert_eq!(config.retry_period, Duration::from_secs(2));
    }

    #[test]
    fn test_identities_are_unique() {
        assert_ne!(default_identity(), default_identity());
    }
}

//! # Command Line
//!
//! Flags of the controller binary. Everything else is configured through
//! environment variables (see `config`).
//!
//! ```bash
//! # Single replica, no lease
//! helm-release-controller --leader-elect=false
//!
//! # Serve probes on a different address
//! helm-release-controller --ui-bind-address 127.0.0.1:9090 --workers 8
//! ```

use clap::{ArgAction, Parser};
use std::net::SocketAddr;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(
    name = "helm-release-controller",
    version,
    about = "Reconciles HelmRelease resources into installed Helm releases"
)]
pub struct Cli {
    /// Compete for the leader lease before reconciling
    #[arg(
        long,
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub leader_elect: bool,

    /// Address for metrics, probes and the leader page [default: 0.0.0.0:$METRICS_PORT]
    #[arg(long)]
    pub ui_bind_address: Option<SocketAddr>,

    /// Number of concurrent reconciliation workers [default: $WORKERS or 4]
    #[arg(long)]
    pub workers: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["helm-release-controller"]).unwrap();
        assert!(cli.leader_elect);
        assert_eq!(cli.ui_bind_address, None);
        assert_eq!(cli.workers, None);
    }

    #[test]
    fn test_leader_elect_forms() {
        let cli = Cli::try_parse_from(["c", "--leader-elect=false"]).unwrap();
        assert!(!cli.leader_elect);
        let cli = Cli::try_parse_from(["c", "--leader-elect"]).unwrap();
        assert!(cli.leader_elect);
    }

    #[test]
    fn test_overrides() {
        let cli =
            Cli::try_parse_from(["c", "--ui-bind-address", "127.0.0.1:9090", "--workers", "8"])
                .unwrap();
        assert_eq!(cli.ui_bind_address, Some("127.0.0.1:9090".parse().unwrap()));
        assert_eq!(cli.workers, Some(8));
    }

    #[test]
    fn test_rejects_bad_address() {
        assert!(Cli::try_parse_from(["c", "--ui-bind-address", "nowhere"]).is_err());
    }
}

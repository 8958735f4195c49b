//! # Helm Release Controller
//!
//! Reconciles `HelmRelease` resources into installed, upgraded and
//! uninstalled Helm releases.
//!
//! See the [README.md](../README.md) for deployment instructions.

use anyhow::Result;
use clap::Parser;
use helm_release_controller::cli::Cli;
use helm_release_controller::runtime::{initialize, run_controller, shutdown_signal, RunOutcome};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let init_result = initialize(&cli).await?;

    let outcome = run_controller(
        init_result.controller,
        init_result.elector,
        init_result.server_state,
        shutdown_signal(),
    )
    .await;

    match outcome {
        RunOutcome::Stopped => {
            info!("Helm Release Controller stopped");
            Ok(())
        }
        // Exit non-zero so the pod is restarted and campaigns again
        RunOutcome::LeadershipLost => Err(anyhow::anyhow!("leadership lost")),
    }
}

//! # Supervisor
//!
//! Gates the control loop on leadership and decides how the process ends.
//! A shutdown signal drains the loop and resigns the lease. A lost lease
//! cancels in-flight reconciliations at once, since a standby may already
//! hold the lease, and reports failure so the orchestrator restarts the pod.

use crate::controller::server::ServerState;
use crate::controller::{Controller, ShutdownOutcome, StopMode};
use crate::leader::LeaderElector;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{error, info, warn};

/// Why the controller stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Shutdown was requested
    Stopped,
    /// Another replica took over or the lease could not be renewed
    LeadershipLost,
}

/// Run the controller while this replica is leader (or unconditionally when
/// `elector` is `None`) until `shutdown` resolves or leadership is lost.
pub async fn run_controller<F>(
    controller: Controller,
    elector: Option<Arc<LeaderElector>>,
    server_state: Arc<ServerState>,
    shutdown: F,
) -> RunOutcome
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    if let Some(elector) = &elector {
        tokio::select! {
            () = elector.campaign() => {}
            () = &mut shutdown => {
                info!("Shutdown requested before leadership was acquired");
                return RunOutcome::Stopped;
            }
        }
    }
    server_state.set_leader(true);

    let (leading_tx, mut leading_rx) = watch::channel(true);
    let renewal = elector.clone().map(|elector| {
        tokio::spawn(async move { elector.run_renewal(leading_tx).await })
    });

    let (stop_tx, stop_rx) = oneshot::channel::<StopMode>();
    let mut loop_handle = tokio::spawn(controller.run_until(async move {
        // A dropped sender cancels the loop as well
        stop_rx.await.unwrap_or(StopMode::Abort)
    }));

    let outcome = tokio::select! {
        () = &mut shutdown => {
            info!("Shutdown requested");
            RunOutcome::Stopped
        }
        lost = leading_rx.wait_for(|leading| !*leading), if renewal.is_some() => {
            if lost.is_ok() {
                error!("Leadership lost, stopping the control loop");
            } else {
                error!("Lease renewal stopped unexpectedly, stopping the control loop");
            }
            RunOutcome::LeadershipLost
        }
        joined = &mut loop_handle => {
            error!("Control loop exited unexpectedly: {:?}", joined);
            return RunOutcome::Stopped;
        }
    };

    let mode = match outcome {
        RunOutcome::Stopped => StopMode::Drain,
        RunOutcome::LeadershipLost => StopMode::Abort,
    };
    let _ = stop_tx.send(mode);
    match loop_handle.await {
        Ok(ShutdownOutcome::Drained) => info!("Control loop drained"),
        Ok(ShutdownOutcome::Aborted { in_flight }) => {
            warn!("Control loop aborted with {} reconciliations in flight", in_flight);
        }
        Err(e) => error!("Control loop task failed: {}", e),
    }

    if let Some(handle) = renewal {
        handle.abort();
    }
    server_state.set_leader(false);

    if outcome == RunOutcome::Stopped {
        if let Some(elector) = &elector {
            if let Err(e) = elector.resign().await {
                warn!("Failed to release lease: {}", e);
            }
        }
    }

    outcome
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}

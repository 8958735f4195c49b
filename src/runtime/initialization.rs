//! # Initialization
//!
//! Controller start-up: rustls setup, tracing, metrics, HTTP server,
//! Kubernetes client, and assembly of the reconciler and control loop.

use crate::backend::HelmCliBackend;
use crate::cli::Cli;
use crate::config::{self, ControllerConfig, LeaseConfig, ServerConfig};
use crate::controller::reconciler::Reconciler;
use crate::controller::server::{start_server, ServerState};
use crate::controller::source::{ChangeSource, KubeChangeSource};
use crate::controller::Controller;
use crate::constants;
use crate::leader::{KubeLeaseLock, LeaderElector};
use crate::observability;
use crate::store::KubeStore;
use anyhow::{Context, Result};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Everything needed to run the controller
#[derive(Debug)]
pub struct InitializationResult {
    /// Control loop, ready to run once leadership is held
    pub controller: Controller,
    /// Present when leader election is enabled
    pub elector: Option<Arc<LeaderElector>>,
    /// Server state for probes and leader status
    pub server_state: Arc<ServerState>,
}

/// Configuration after command line overrides
#[derive(Debug, Clone)]
pub struct Settings {
    pub controller: ControllerConfig,
    pub server: ServerConfig,
    pub lease: LeaseConfig,
    pub leader_elect: bool,
}

impl Settings {
    /// Environment configuration with flags applied on top
    pub fn resolve(cli: &Cli) -> Self {
        let (mut controller, mut server, lease) = config::load_config();
        if let Some(workers) = cli.workers {
            controller.workers = workers;
        }
        if let Some(addr) = cli.ui_bind_address {
            server.bind_address = addr;
        }
        Self {
            controller,
            server,
            lease,
            leader_elect: cli.leader_elect,
        }
    }
}

/// Install tracing with an env filter, defaulting to info for this crate
pub fn init_tracing() {
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "helm_release_controller=info".into()),
        )
        .try_init()
    {
        eprintln!("Tracing subscriber already initialized: {e}");
    }
}

/// Initialize the controller runtime
///
/// This function handles:
/// - rustls crypto provider setup
/// - Tracing subscriber setup
/// - Metrics registration
/// - HTTP server startup
/// - Kubernetes client creation
/// - Store, backend, change source and leader elector setup
pub async fn initialize(cli: &Cli) -> Result<InitializationResult> {
    // Configure rustls crypto provider FIRST, before anything opens a TLS connection
    let crypto_installed = rustls::crypto::ring::default_provider()
        .install_default()
        .is_ok();

    init_tracing();
    if !crypto_installed {
        warn!("A rustls crypto provider was already installed, keeping it");
    }

    info!("Starting Helm Release Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    let settings = Settings::resolve(cli);
    info!(
        "Configuration: workers={}, reconcile_timeout={}s, failure_requeue={}s, leader_elect={}",
        settings.controller.workers,
        settings.controller.reconcile_timeout.as_secs(),
        settings.controller.failure_requeue_interval.as_secs(),
        settings.leader_elect
    );

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::new(settings.lease.identity.clone()));
    let server_state_clone = server_state.clone();
    let bind_address = settings.server.bind_address;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(bind_address, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &settings.server).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let store = Arc::new(KubeStore::new(
        client.clone(),
        settings.controller.watch_namespace.clone(),
        Some(settings.lease.identity.clone()),
    ));
    let backend = Arc::new(
        HelmCliBackend::locate(settings.controller.helm_timeout)
            .context("Failed to locate the helm binary")?,
    );
    let sources: Vec<Box<dyn ChangeSource>> = vec![Box::new(KubeChangeSource::new(
        store.scoped_api(),
        constants::DEFAULT_WATCH_MAX_BACKOFF_MS,
    ))];
    let reconciler = Arc::new(Reconciler::new(
        store,
        backend,
        settings.controller.failure_requeue_interval,
    ));
    let controller = Controller::new(reconciler, settings.controller.clone(), sources);

    let elector = settings.leader_elect.then(|| {
        let lock = KubeLeaseLock::new(
            client.clone(),
            &settings.lease.lease_namespace,
            &settings.lease.lease_name,
        );
        Arc::new(LeaderElector::new(Arc::new(lock), settings.lease.clone()))
    });
    if elector.is_none() {
        warn!("Leader election disabled; run a single replica only");
    }

    info!("Controller initialized");
    Ok(InitializationResult {
        controller,
        elector,
        server_state,
    })
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    config: &ServerConfig,
) -> Result<()> {
    let startup_timeout = Duration::from_secs(config.startup_timeout_secs);
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let start_time = std::time::Instant::now();

    loop {
        // Check if server task crashed
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }

        if server_state
            .is_ready
            .load(std::sync::atomic::Ordering::Relaxed)
        {
            info!("HTTP server is ready and accepting connections");
            break;
        }

        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }

        tokio::time::sleep(poll_interval).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_flags_override_environment() {
        let cli = Cli::try_parse_from([
            "c",
            "--workers",
            "9",
            "--ui-bind-address",
            "127.0.0.1:9999",
            "--leader-elect=false",
        ])
        .unwrap();
        let settings = Settings::resolve(&cli);
        assert_eq!(settings.controller.workers, 9);
        assert_eq!(settings.server.bind_address.to_string(), "127.0.0.1:9999");
        assert!(!settings.leader_elect);
    }

    #[tokio::test]
    async fn test_wait_for_server_ready_fails_when_server_exits() {
        let state = Arc::new(ServerState::new("pod-a"));
        let handle = tokio::spawn(async {});
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = wait_for_server_ready(&state, &handle, &ServerConfig::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_server_ready_times_out() {
        let state = Arc::new(ServerState::new("pod-a"));
        let handle = tokio::spawn(std::future::pending::<()>());
        let config = ServerConfig {
            startup_timeout_secs: 0,
            poll_interval_ms: 5,
            ..ServerConfig::default()
        };
        let result = wait_for_server_ready(&state, &handle, &config).await;
        assert!(result.is_err());
        handle.abort();
    }
}

//! # HTTP Server
//!
//! Probes, Prometheus metrics and leadership status. The server runs on
//! every replica, leader or not.

use crate::observability;
use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared state read by the probe handlers
#[derive(Debug)]
pub struct ServerState {
    /// Set once the listener is bound
    pub is_ready: Arc<AtomicBool>,
    /// Whether this replica currently holds the lease
    pub is_leader: Arc<AtomicBool>,
    /// Lease holder identity of this replica
    pub identity: String,
}

impl ServerState {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            is_ready: Arc::new(AtomicBool::new(false)),
            is_leader: Arc::new(AtomicBool::new(false)),
            identity: identity.into(),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.is_leader.store(leader, Ordering::Relaxed);
        observability::metrics::set_leader(leader);
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct LeaderResponse {
    identity: String,
    is_leader: bool,
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/leader", get(leader))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Bind and serve until the process exits. Marks the state ready once the
/// listener is bound.
pub async fn start_server(addr: SocketAddr, state: Arc<ServerState>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {addr}"))?;
    info!("HTTP server listening on http://{}", addr);
    state.is_ready.store(true, Ordering::Relaxed);

    let app = router(state.clone());
    if let Err(e) = axum::serve(listener, app).await {
        state.is_ready.store(false, Ordering::Relaxed);
        error!("HTTP server stopped: {}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<Arc<ServerState>>) -> Response {
    if state.is_ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

async fn metrics() -> Response {
    match observability::metrics::gather_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn leader(State(state): State<Arc<ServerState>>) -> Json<LeaderResponse> {
    Json(LeaderResponse {
        identity: state.identity.clone(),
        is_leader: state.is_leader.load(Ordering::Relaxed),
    })
}

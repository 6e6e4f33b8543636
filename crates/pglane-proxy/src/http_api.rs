//! Liveness and readiness endpoints
//!
//! Served on a separate port so orchestrator probes never contend with
//! proxy traffic. `/health` answers 200 for as long as the process runs;
//! `/ready` answers 503 until the proxy listener is accepting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tracing::info;

/// Shared readiness flag, flipped once at startup
#[derive(Clone, Default)]
pub struct ReadyState(Arc<AtomicBool>);

impl ReadyState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.0.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Health check endpoint
async fn health() -> &'static str {
    "ok"
}

/// Readiness check endpoint
async fn ready(State(state): State<ReadyState>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

pub fn router(state: ReadyState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(state)
}

/// Serve the probe endpoints on the given listener.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: ReadyState,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "health server listening");
    axum::serve(listener, router(state)).await
}

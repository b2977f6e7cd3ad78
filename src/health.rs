//! Health-check HTTP endpoint.
//!
//! `GET /` runs a live resolution of the service host and reports the
//! address; `GET /status` returns the connection state as JSON.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use knight_core::config::HealthConfig;
use knight_session::{Resolver, StateHandle};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared state for the health handlers.
#[derive(Clone)]
pub struct HealthState {
    pub resolver: Arc<Resolver>,
    pub state: StateHandle,
}

/// Build the axum router with shared state.
pub fn build_router(state: HealthState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/status", get(status))
        .with_state(state)
}

/// Bind and serve until the task is dropped.
pub async fn serve(config: HealthConfig, state: HealthState) {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("health server failed to bind to {addr}: {e}");
            return;
        }
    };

    info!("health server listening on {addr}");

    if let Err(e) = axum::serve(listener, build_router(state)).await {
        error!("health server error: {e}");
    }
}

async fn root(State(state): State<HealthState>) -> impl IntoResponse {
    let host = state.resolver.service_host().to_string();
    match state.resolver.lookup_all(&host).await {
        Ok(ip) => (
            StatusCode::OK,
            format!("running ({}), resolved: {ip}", state.state.phase()),
        ),
        Err(e) => {
            warn!("health: resolution of {host} failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("resolution failed: {e}"),
            )
        }
    }
}

async fn status(State(state): State<HealthState>) -> impl IntoResponse {
    Json(state.state.snapshot())
}

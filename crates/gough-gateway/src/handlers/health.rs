//! Liveness, readiness, and metrics endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use gough_store::Store;

use crate::state::GatewayState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

/// `GET /healthz`
pub async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "gough-gateway",
    })
}

/// `GET /readyz`: ready once the store answers and a user CA is active.
pub async fn readyz<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
) -> impl IntoResponse {
    if state.store.list_providers().is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "store unavailable");
    }
    if state.ca.active_ca().is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "no active CA");
    }
    (StatusCode::OK, "ready")
}

/// `GET /metrics`
pub async fn metrics<S: Store + 'static>(
    State(state): State<Arc<GatewayState<S>>>,
) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

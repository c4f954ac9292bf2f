use crate::server::state::AppState;
use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    /// Downloads currently registered in the cache
    in_flight: usize,
    uptime_seconds: u64,
}

/// Liveness check with a snapshot of download activity
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        in_flight: state.cache.in_flight(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Prometheus text exposition
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

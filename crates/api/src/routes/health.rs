use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Admission tickets currently held.
    pub active_jobs: usize,
    pub capacity: usize,
}

/// GET /health -- service liveness plus admission occupancy.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let admission = state.orchestrator.admission();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_jobs: admission.outstanding(),
        capacity: admission.capacity(),
    })
}

/// Mount health check routes (root level, not under `/api/v1`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

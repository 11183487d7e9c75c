pub mod batches;
pub mod callbacks;
pub mod health;
pub mod jobs;
pub mod stats;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /jobs                        list, submit
/// /jobs/{id}/progress          progress snapshot
/// /jobs/{id}/status            detailed status with history
/// /jobs/{id}/cancel            cancel (POST)
/// /jobs/{id}/retry             retry a failed job (POST)
///
/// /batches                     submit
/// /batches/{id}                snapshot
/// /batches/{id}/cancel         cancel (POST)
///
/// /stats                       orchestration counters
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/batches", batches::router())
        .merge(stats::router())
}

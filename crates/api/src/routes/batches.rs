//! Route definitions for the `/batches` resource.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::batches;
use crate::state::AppState;

/// Routes mounted at `/batches`.
///
/// ```text
/// POST   /                -> submit_batch
/// GET    /{id}            -> get_batch
/// POST   /{id}/cancel     -> cancel_batch
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(batches::submit_batch))
        .route("/{id}", get(batches::get_batch))
        .route("/{id}/cancel", post(batches::cancel_batch))
}

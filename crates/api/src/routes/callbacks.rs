use axum::routing::post;
use axum::Router;

use crate::handlers::callbacks;
use crate::state::AppState;

/// Provider callback ingestion, mounted at the root so callback URLs stay
/// short: `POST /callback/{provider}`.
pub fn router() -> Router<AppState> {
    Router::new().route("/callback/{provider}", post(callbacks::receive_callback))
}

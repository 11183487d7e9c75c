//! Handlers for the `/batches` resource.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use genflow_core::batch::BatchSpec;

use crate::error::AppResult;
use crate::response::{Accepted, DataResponse};
use crate::state::AppState;

/// POST /api/v1/batches
///
/// Returns 201 with the batch snapshot, member ids already assigned.
pub async fn submit_batch(
    State(state): State<AppState>,
    Json(spec): Json<BatchSpec>,
) -> AppResult<impl IntoResponse> {
    let batch_id = state.batches.submit_batch(spec)?;
    let snapshot = state.batches.get_batch(&batch_id)?;
    Ok((StatusCode::CREATED, Json(DataResponse { data: snapshot })))
}

/// GET /api/v1/batches/{id}
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let snapshot = state.batches.get_batch(&batch_id)?;
    Ok(Json(DataResponse { data: snapshot }))
}

/// POST /api/v1/batches/{id}/cancel
pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let accepted = state.batches.cancel_batch(&batch_id)?;
    Ok(Json(DataResponse {
        data: Accepted { accepted },
    }))
}

//! Handlers for the `/jobs` resource.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use genflow_core::job::JobInput;
use genflow_pipeline::JobFilter;

use crate::error::AppResult;
use crate::response::{Accepted, DataResponse};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Validate and enqueue a generation job. Returns 201 with the job's
/// initial progress snapshot.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(input): Json<JobInput>,
) -> AppResult<impl IntoResponse> {
    let job_id = state.orchestrator.submit(input)?;
    let progress = state.orchestrator.query().get_progress(&job_id)?;

    tracing::info!(job_id = %job_id, "Job submitted");

    Ok((StatusCode::CREATED, Json(DataResponse { data: progress })))
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs
///
/// List jobs, newest first. Supports `state`, `type`, `user_id`,
/// `batch_id`, `limit` and `offset` query parameters.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(filter): Query<JobFilter>,
) -> AppResult<impl IntoResponse> {
    let jobs = state.orchestrator.query().list_jobs(filter);
    Ok(Json(DataResponse { data: jobs }))
}

/// GET /api/v1/jobs/{id}/progress
pub async fn get_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let progress = state.orchestrator.query().get_progress(&job_id)?;
    Ok(Json(DataResponse { data: progress }))
}

/// GET /api/v1/jobs/{id}/status
///
/// Progress plus provider details and the full audit history.
pub async fn get_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let status = state.orchestrator.query().get_detailed_status(&job_id)?;
    Ok(Json(DataResponse { data: status }))
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs/{id}/cancel
///
/// Request cancellation. `accepted` is `false` when the job had already
/// finished; the job reaches `CANCELLED` asynchronously otherwise.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let accepted = state.orchestrator.cancel(&job_id)?;
    Ok(Json(DataResponse {
        data: Accepted { accepted },
    }))
}

/// POST /api/v1/jobs/{id}/retry
///
/// Resubmit a `FAILED` job as a new job. Returns 201 with the new job's
/// progress snapshot.
pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let new_id = state.orchestrator.retry(&job_id)?;
    let progress = state.orchestrator.query().get_progress(&new_id)?;

    tracing::info!(job_id = %new_id, retry_of = %job_id, "Job retried");

    Ok((StatusCode::CREATED, Json(DataResponse { data: progress })))
}

//! Provider callback ingestion.
//!
//! The handler only authenticates and parses the body. Correlation runs on
//! a spawned task so the provider gets its 202 without waiting on the job.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use genflow_core::signing::verify_signature;
use genflow_pipeline::{DeliveryOutcome, PipelineError};
use genflow_provider::CallbackPayload;
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Header carrying `sha256=<hex hmac>` of the raw body.
pub const CALLBACK_SIGNATURE_HEADER: &str = "x-callback-signature";

#[derive(Debug, Serialize)]
pub struct CallbackReceipt {
    pub received: bool,
}

/// POST /callback/{provider}
pub async fn receive_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    if state.orchestrator.providers().by_name(&provider).is_none() {
        return Err(PipelineError::NotFound {
            entity: "provider",
            id: provider,
        }
        .into());
    }

    if let Some(secret) = state.config.callback_secret.as_deref() {
        let signature = headers
            .get(CALLBACK_SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(secret, &body, signature) {
            tracing::warn!(provider = %provider, "Callback mismatch: signature did not verify");
            return Err(AppError::Unauthorized("invalid callback signature".into()));
        }
    }

    let payload = CallbackPayload::parse(&body).map_err(|e| {
        tracing::warn!(provider = %provider, error = %e, "Callback mismatch: unreadable body");
        AppError::Pipeline(PipelineError::CallbackMismatch(e.to_string()))
    })?;

    tracing::debug!(
        provider = %provider,
        token = %payload.external_request_id,
        status = %payload.status,
        "Callback received"
    );

    let registry = state.orchestrator.registry().clone();
    tokio::spawn(async move {
        match registry.deliver(&payload) {
            Ok(DeliveryOutcome::Resumed) | Ok(DeliveryOutcome::InProgress) => {}
            Ok(outcome) => {
                tracing::info!(token = %payload.external_request_id, ?outcome, "Callback had no effect");
            }
            Err(e) => {
                tracing::warn!(token = %payload.external_request_id, error = %e, "Callback rejected");
            }
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: CallbackReceipt { received: true },
        }),
    ))
}

//! The contract between the pipeline and an external generation service.

use async_trait::async_trait;
use genflow_core::job::JobType;
use genflow_core::types::JobId;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Everything a provider needs to start one generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub job_id: JobId,
    pub job_type: JobType,
    pub prompt: String,
    pub params: serde_json::Value,
    /// Opaque token the provider must echo back as `external_request_id`
    /// in its callback.
    pub correlation_token: String,
    /// Where the provider should POST its callback, when it supports one.
    pub callback_url: Option<String>,
}

/// Acknowledgement of an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    /// Provider-side identifier, used for polling and cancellation.
    pub provider_ref: String,
    /// Whether a callback will be pushed for this request. When false the
    /// pipeline goes straight to polling.
    pub callback_supported: bool,
}

/// Result of a single status check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollStatus {
    Pending { percent: Option<u8> },
    Completed { result_url: String },
    Failed { error: String },
}

impl PollStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Self::Pending { .. })
    }
}

/// An external generation service.
///
/// Implementations must be cheap to share (`Arc<dyn GenerationProvider>`)
/// and safe to call concurrently for different jobs.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Name used in callback URLs (`/callback/{name}`) and logs.
    fn name(&self) -> &str;

    async fn submit(&self, request: &GenerationRequest) -> Result<SubmitReceipt, ProviderError>;

    async fn poll(&self, provider_ref: &str) -> Result<PollStatus, ProviderError>;

    /// Best-effort cancellation of remote work. Providers without a cancel
    /// endpoint keep the default no-op.
    async fn cancel(&self, provider_ref: &str) -> Result<(), ProviderError> {
        let _ = provider_ref;
        Ok(())
    }
}

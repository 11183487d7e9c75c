//! REST client for an HTTP generation service.
//!
//! Endpoints, relative to the configured base URL:
//!
//! ```text
//! POST   /generations          submit, returns { id, callback? }
//! GET    /generations/{id}     status, returns { status, progress?, result_url?, error? }
//! DELETE /generations/{id}     cancel
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::callback::{classify_status, StatusClass};
use crate::error::ProviderError;
use crate::provider::{GenerationProvider, GenerationRequest, PollStatus, SubmitReceipt};

/// HTTP request timeout for a single provider call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for a single generation service.
pub struct HttpProvider {
    client: reqwest::Client,
    name: String,
    base_url: String,
    callbacks: bool,
}

/// Response of `POST /generations`.
#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
    /// Service-side override of callback support for this request.
    #[serde(default)]
    callback: Option<bool>,
}

/// Response of `GET /generations/{id}`.
#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    progress: Option<u8>,
    #[serde(default)]
    result_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpProvider {
    /// Create a client for a generation service.
    ///
    /// * `base_url` - e.g. `https://api.example.com/v1`, no trailing slash.
    /// * `callbacks` - whether the service pushes callbacks.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, callbacks: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build reqwest HTTP client");
        Self::with_client(client, name, base_url, callbacks)
    }

    /// Create a client reusing an existing [`reqwest::Client`]
    /// (connection pooling across providers).
    pub fn with_client(
        client: reqwest::Client,
        name: impl Into<String>,
        base_url: impl Into<String>,
        callbacks: bool,
    ) -> Self {
        Self {
            client,
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            callbacks,
        }
    }

    // ---- private helpers ----

    /// Map a non-2xx response into a classified [`ProviderError`].
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(status.as_u16(), body.trim()))
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let response = Self::ensure_success(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::Permanent(format!("invalid provider response: {e}")))
    }
}

#[async_trait]
impl GenerationProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<SubmitReceipt, ProviderError> {
        let callback_url = if self.callbacks {
            request.callback_url.clone()
        } else {
            None
        };
        let body = serde_json::json!({
            "type": request.job_type,
            "prompt": request.prompt,
            "params": request.params,
            "external_request_id": request.correlation_token,
            "callback_url": callback_url,
        });

        let response = self
            .client
            .post(format!("{}/generations", self.base_url))
            .json(&body)
            .send()
            .await?;

        let parsed: SubmitResponse = Self::parse_response(response).await?;
        let callback_supported =
            callback_url.is_some() && parsed.callback.unwrap_or(self.callbacks);

        tracing::debug!(
            provider = %self.name,
            job_id = %request.job_id,
            provider_ref = %parsed.id,
            callback_supported,
            "Provider accepted generation request"
        );

        Ok(SubmitReceipt {
            provider_ref: parsed.id,
            callback_supported,
        })
    }

    async fn poll(&self, provider_ref: &str) -> Result<PollStatus, ProviderError> {
        let response = self
            .client
            .get(format!("{}/generations/{}", self.base_url, provider_ref))
            .send()
            .await?;

        let parsed: StatusResponse = Self::parse_response(response).await?;
        match classify_status(&parsed.status) {
            Some(StatusClass::Success) => match parsed.result_url {
                Some(url) => Ok(PollStatus::Completed { result_url: url }),
                None => Ok(PollStatus::Failed {
                    error: "provider reported success without a result_url".into(),
                }),
            },
            Some(StatusClass::Failure) => Ok(PollStatus::Failed {
                error: parsed
                    .error
                    .unwrap_or_else(|| format!("provider reported status \"{}\"", parsed.status)),
            }),
            Some(StatusClass::InProgress) => Ok(PollStatus::Pending {
                percent: parsed.progress.map(|p| p.min(100)),
            }),
            None => Err(ProviderError::Permanent(format!(
                "unrecognised provider status \"{}\"",
                parsed.status
            ))),
        }
    }

    async fn cancel(&self, provider_ref: &str) -> Result<(), ProviderError> {
        let response = self
            .client
            .delete(format!("{}/generations/{}", self.base_url, provider_ref))
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }
}

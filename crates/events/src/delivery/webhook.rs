//! Webhook notifications with exponential-backoff retry.
//!
//! [`WebhookDelivery`] sends a JSON-encoded [`JobEvent`] to an external URL
//! via HTTP POST, optionally signed with HMAC-SHA256 in the
//! `x-genflow-signature` header. Failed attempts are retried with
//! exponential backoff (1 s, 2 s, 4 s by default).
//!
//! [`WebhookNotifier`] listens on the event bus and dispatches a delivery
//! for each terminal job event whose payload carries a `webhook_url`.

use std::sync::Arc;
use std::time::Duration;

use genflow_core::job_events::is_terminal_job_event;
use genflow_core::signing::signature_header;
use tokio::sync::broadcast;

use crate::bus::JobEvent;

/// Header carrying the `sha256=<hex>` signature of the request body.
pub const SIGNATURE_HEADER: &str = "x-genflow-signature";

/// Default retry delays in seconds (exponential backoff: 1s, 2s, 4s).
const RETRY_DELAYS_SECS: [u64; 3] = [1, 2, 4];

/// HTTP request timeout for a single delivery attempt.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Error type for webhook delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The underlying HTTP request failed (network, DNS, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The remote server returned a non-2xx status code.
    #[error("Webhook returned HTTP {0}")]
    HttpStatus(u16),

    #[error("Failed to encode webhook body: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// WebhookDelivery
// ---------------------------------------------------------------------------

/// Delivers job events to submitter webhook endpoints.
pub struct WebhookDelivery {
    client: reqwest::Client,
    secret: Option<String>,
    retry_delays: Vec<Duration>,
}

impl WebhookDelivery {
    /// Create a new delivery service with a pre-configured HTTP client.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build reqwest HTTP client");
        Self {
            client,
            secret: None,
            retry_delays: RETRY_DELAYS_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }

    /// Sign every request body with this secret.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Override the backoff schedule. One retry is made per entry.
    pub fn with_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.retry_delays = delays;
        self
    }

    /// Deliver an event to a webhook URL with retry.
    ///
    /// Returns `Ok(())` on the first successful attempt.
    pub async fn deliver(&self, url: &str, event: &JobEvent) -> Result<(), WebhookError> {
        let body = serde_json::to_vec(&serde_json::json!({
            "event_type": event.event_type,
            "job_id": event.job_id,
            "batch_id": event.batch_id,
            "payload": event.payload,
            "timestamp": event.timestamp,
        }))?;
        let signature = self.secret.as_deref().map(|s| signature_header(s, &body));

        let mut last_err: Option<WebhookError> = None;

        for (attempt, delay) in self.retry_delays.iter().enumerate() {
            match self.try_send(url, &body, signature.as_deref()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        url,
                        error = %e,
                        "Webhook delivery attempt failed, retrying"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(*delay).await;
                }
            }
        }

        // Final attempt after the last backoff.
        match self.try_send(url, &body, signature.as_deref()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(url, error = %e, "Webhook delivery failed after all retries");
                Err(last_err.unwrap_or(e))
            }
        }
    }

    /// Execute a single POST request and check the response status.
    async fn try_send(
        &self,
        url: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<(), WebhookError> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        if let Some(sig) = signature {
            request = request.header(SIGNATURE_HEADER, sig);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(WebhookError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

impl Default for WebhookDelivery {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// WebhookNotifier
// ---------------------------------------------------------------------------

/// Bus subscriber that forwards terminal job events to submitter webhooks.
pub struct WebhookNotifier;

impl WebhookNotifier {
    /// Run until the bus closes. Each delivery runs on its own task so a
    /// slow endpoint never stalls the subscription.
    pub async fn run(delivery: Arc<WebhookDelivery>, mut receiver: broadcast::Receiver<JobEvent>) {
        tracing::info!("Webhook notifier started");

        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if !is_terminal_job_event(&event.event_type) {
                        continue;
                    }
                    let Some(url) = event
                        .payload
                        .get("webhook_url")
                        .and_then(|v| v.as_str())
                        .map(str::to_owned)
                    else {
                        continue;
                    };

                    let delivery = Arc::clone(&delivery);
                    tokio::spawn(async move {
                        if let Err(e) = delivery.deliver(&url, &event).await {
                            tracing::error!(
                                job_id = ?event.job_id,
                                event_type = %event.event_type,
                                error = %e,
                                "Dropping webhook notification"
                            );
                        }
                    });
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Webhook notifier lagged, some events were skipped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, webhook notifier shutting down");
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use genflow_core::job_events::{JOB_COMPLETED, JOB_PROGRESS};
    use genflow_core::signing::verify_signature;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast_delivery() -> WebhookDelivery {
        WebhookDelivery::new().with_retry_delays(vec![Duration::from_millis(5); 2])
    }

    #[test]
    fn webhook_error_display_http_status() {
        let err = WebhookError::HttpStatus(502);
        assert_eq!(err.to_string(), "Webhook returned HTTP 502");
    }

    #[tokio::test]
    async fn delivers_signed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let delivery = fast_delivery().with_secret("s3cret");
        let event = JobEvent::new(JOB_COMPLETED).for_job("job-1");
        delivery
            .deliver(&format!("{}/hook", server.uri()), &event)
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        let header = request
            .headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert!(verify_signature("s3cret", &request.body, header));

        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["event_type"], JOB_COMPLETED);
        assert_eq!(body["job_id"], "job-1");
    }

    #[tokio::test]
    async fn retries_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let err = fast_delivery()
            .deliver(&server.uri(), &JobEvent::new(JOB_COMPLETED))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::HttpStatus(503)));
    }

    #[tokio::test]
    async fn notifier_only_forwards_terminal_events_with_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/done"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let bus = EventBus::default();
        let handle = tokio::spawn(WebhookNotifier::run(
            Arc::new(fast_delivery()),
            bus.subscribe(),
        ));

        let url = format!("{}/done", server.uri());
        bus.publish(
            JobEvent::new(JOB_PROGRESS)
                .for_job("j")
                .with_payload(serde_json::json!({ "webhook_url": url })),
        );
        bus.publish(JobEvent::new(JOB_COMPLETED).for_job("no-hook"));
        bus.publish(
            JobEvent::new(JOB_COMPLETED)
                .for_job("j")
                .with_payload(serde_json::json!({ "webhook_url": url })),
        );
        drop(bus);
        handle.await.unwrap();

        // Deliveries run on detached tasks.
        for _ in 0..50 {
            if !server.received_requests().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // `expect(1)` is verified when the server drops.
    }
}

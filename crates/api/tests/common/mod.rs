#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use genflow_core::backoff::BackoffPolicy;
use genflow_events::EventBus;
use genflow_pipeline::{Orchestrator, PipelineConfig, ProviderSet};
use genflow_provider::ScriptedProvider;
use http_body_util::BodyExt;
use tower::ServiceExt;

use genflow_api::config::{ProviderSettings, ServerConfig};
use genflow_api::router::build_app_router;
use genflow_api::state::AppState;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    let provider = |name: &str| ProviderSettings {
        name: name.to_string(),
        url: None,
        callbacks: true,
    };
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        public_base_url: Some("http://genflow.test".to_string()),
        callback_secret: None,
        webhook_secret: None,
        event_journal_path: None,
        image_provider: provider("kling"),
        video_provider: provider("kling"),
    }
}

/// Millisecond-scale pipeline timings. Callbacks are waited for long
/// enough that a test always delivers them before polling starts.
pub fn pipeline_config() -> PipelineConfig {
    let fast = BackoffPolicy {
        initial_interval: Duration::from_millis(2),
        multiplier: 2.0,
        max_interval: Duration::from_millis(10),
        max_attempts: 3,
    };
    PipelineConfig {
        max_concurrent_jobs: 2,
        admission_timeout: Duration::from_secs(10),
        callback_wait: Duration::from_secs(10),
        polling: fast.clone(),
        submit_retry: fast,
        ..PipelineConfig::default()
    }
    .with_callback_base_url("http://genflow.test")
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub provider: Arc<ScriptedProvider>,
}

impl TestApp {
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.state.orchestrator
    }
}

/// Build the full application router over a scripted callback-capable
/// provider named `kling`.
pub fn build_test_app() -> TestApp {
    build_test_app_with(test_config())
}

pub fn build_test_app_with(config: ServerConfig) -> TestApp {
    let provider = Arc::new(ScriptedProvider::new("kling").with_callbacks(true));
    let orchestrator = Orchestrator::new(
        pipeline_config(),
        ProviderSet::uniform(provider.clone()),
        Arc::new(EventBus::default()),
    );
    let state = AppState::new(config, orchestrator);
    TestApp {
        router: build_app_router(state.clone()),
        state,
        provider,
    }
}

pub async fn get(app: &TestApp, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.router.clone().oneshot(request).await.unwrap()
}

pub async fn post_json(app: &TestApp, uri: &str, body: serde_json::Value) -> Response {
    post_raw(app, uri, body.to_string().into_bytes(), &[]).await
}

pub async fn post_empty(app: &TestApp, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.router.clone().oneshot(request).await.unwrap()
}

pub async fn post_raw(
    app: &TestApp,
    uri: &str,
    body: Vec<u8>,
    headers: &[(&str, &str)],
) -> Response {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Body::from(body)).unwrap();
    app.router.clone().oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Wait until `job_id` has an open correlation token and a provider ref.
pub async fn open_token(app: &TestApp, job_id: &str) -> String {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let orchestrator = app.orchestrator();
            if let Some(token) = orchestrator.registry().token_for_job(job_id) {
                if orchestrator.store().get(job_id).unwrap().provider_ref.is_some() {
                    return token;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("job never registered a token")
}

//! Shared helpers for pipeline integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use genflow_core::audit::AuditEventKind;
use genflow_core::backoff::BackoffPolicy;
use genflow_core::job::{JobInput, JobState, JobType};
use genflow_events::EventBus;
use genflow_pipeline::{Orchestrator, PipelineConfig, ProviderSet};
use genflow_provider::{CallbackPayload, ScriptedProvider};

/// Upper bound on any single wait in a test.
pub const TEST_DEADLINE: Duration = Duration::from_secs(10);

/// Fail the test instead of hanging when `fut` does not finish in time.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(TEST_DEADLINE, fut)
        .await
        .expect("operation did not finish in time")
}

/// Millisecond-scale configuration. Callback-capable providers wait the
/// full deadline for their callback unless a test shortens it.
pub fn fast_config(max_concurrent_jobs: usize) -> PipelineConfig {
    PipelineConfig {
        max_concurrent_jobs,
        admission_timeout: TEST_DEADLINE,
        callback_wait: TEST_DEADLINE,
        polling: BackoffPolicy {
            initial_interval: Duration::from_millis(2),
            multiplier: 2.0,
            max_interval: Duration::from_millis(10),
            max_attempts: 5,
        },
        submit_retry: BackoffPolicy {
            initial_interval: Duration::from_millis(2),
            multiplier: 2.0,
            max_interval: Duration::from_millis(10),
            max_attempts: 3,
        },
        token_grace: Duration::from_secs(60),
        token_max_staleness: Duration::from_secs(600),
        token_sweep_interval: Duration::from_secs(1),
        callback_base_url: Some("http://genflow.test".into()),
    }
}

pub fn orchestrator(config: PipelineConfig, provider: Arc<ScriptedProvider>) -> Orchestrator {
    Orchestrator::new(
        config,
        ProviderSet::uniform(provider),
        Arc::new(EventBus::default()),
    )
}

pub fn image(id: &str) -> JobInput {
    JobInput::new(JobType::Image, format!("render {id}")).with_id(id)
}

pub fn success(token: &str, result_url: &str) -> CallbackPayload {
    CallbackPayload {
        external_request_id: token.into(),
        status: "success".into(),
        result_url: Some(result_url.into()),
        error: None,
        progress: None,
    }
}

pub fn failure(token: &str, error: &str) -> CallbackPayload {
    CallbackPayload {
        external_request_id: token.into(),
        status: "failed".into(),
        result_url: None,
        error: Some(error.into()),
        progress: None,
    }
}

/// Wait until `job_id` has an open correlation token and return it.
pub async fn open_token(orchestrator: &Orchestrator, job_id: &str) -> String {
    within(async {
        loop {
            if let Some(token) = orchestrator.registry().token_for_job(job_id) {
                let job = orchestrator.store().get(job_id).expect("job exists");
                if job.provider_ref.is_some() {
                    return token;
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
}

/// Wait until `job_id` is in `state`.
pub async fn reach_state(orchestrator: &Orchestrator, job_id: &str, state: JobState) {
    let mut rx = orchestrator.store().subscribe(job_id).expect("job exists");
    within(rx.wait_for(|s| *s == state))
        .await
        .expect("state channel open");
}

/// Wait until `job_id` has handed its admission ticket back. Completed and
/// failed jobs release after their terminal state is written.
pub async fn released(orchestrator: &Orchestrator, job_id: &str) {
    within(async {
        loop {
            let history = orchestrator.store().history(job_id).expect("job exists");
            if history.iter().any(|e| e.kind == AuditEventKind::AdmissionReleased) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
}

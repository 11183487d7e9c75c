//! Polling Fallback Scheduler.
//!
//! Checks provider status on an exponential backoff schedule when the
//! provider offers no callback or the callback is late. The scheduler only
//! reports what it saw; whether the result is applied is decided by the
//! caller through [`CorrelationRegistry::claim`](crate::registry::CorrelationRegistry::claim).

use genflow_core::audit::AuditEventKind;
use genflow_core::backoff::BackoffPolicy;
use genflow_core::job::Step;
use genflow_provider::{GenerationProvider, PollStatus, ProviderError};
use serde_json::json;

use crate::error::PipelineError;
use crate::registry::ResumeEvent;
use crate::store::JobStore;

pub struct PollingScheduler {
    policy: BackoffPolicy,
}

impl PollingScheduler {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Poll until the provider reports a terminal status.
    ///
    /// Each attempt waits the current backoff delay first. Transient poll
    /// errors count as attempts; a permanent error ends polling at once.
    /// Running out of attempts yields [`PipelineError::ProviderTimeout`].
    pub async fn poll_until_resolved(
        &self,
        store: &JobStore,
        provider: &dyn GenerationProvider,
        job_id: &str,
        provider_ref: &str,
    ) -> Result<ResumeEvent, PipelineError> {
        let mut delay = self.policy.initial_interval;

        for attempt in 1..=self.policy.max_attempts {
            tokio::time::sleep(delay).await;
            delay = self.policy.next_delay(delay);

            let result = provider.poll(provider_ref).await;
            store.record(
                job_id,
                AuditEventKind::PollAttempt,
                json!({
                    "attempt": attempt,
                    "provider_ref": provider_ref,
                    "result": describe(&result),
                }),
            )?;

            match result {
                Ok(PollStatus::Pending { percent }) => {
                    store.report_progress(
                        job_id,
                        Step::Polling,
                        percent,
                        format!("status check {attempt}/{}: pending", self.policy.max_attempts),
                    )?;
                }
                Ok(PollStatus::Completed { result_url }) => {
                    tracing::debug!(job_id, attempt, "Poll resolved job");
                    return Ok(ResumeEvent::Completed { result_url });
                }
                Ok(PollStatus::Failed { error }) => {
                    return Ok(ResumeEvent::Failed { error });
                }
                Err(ProviderError::Transient(message)) => {
                    tracing::warn!(job_id, attempt, error = %message, "Status check failed, will retry");
                }
                Err(ProviderError::Permanent(message)) => {
                    return Err(PipelineError::PermanentProvider(message));
                }
            }
        }

        tracing::warn!(job_id, attempts = self.policy.max_attempts, "Polling exhausted");
        Err(PipelineError::ProviderTimeout {
            attempts: self.policy.max_attempts,
        })
    }
}

fn describe(result: &Result<PollStatus, ProviderError>) -> String {
    match result {
        Ok(PollStatus::Pending { .. }) => "pending".into(),
        Ok(PollStatus::Completed { .. }) => "completed".into(),
        Ok(PollStatus::Failed { .. }) => "failed".into(),
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use genflow_core::job::{JobInput, JobState, JobType};
    use genflow_events::EventBus;
    use genflow_provider::ScriptedProvider;

    use crate::store::ProgressUpdate;

    fn fast_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial_interval: Duration::from_millis(1),
            multiplier: 2.0,
            max_interval: Duration::from_millis(4),
            max_attempts,
        }
    }

    fn waiting_job() -> JobStore {
        let store = JobStore::new(Arc::new(EventBus::default()));
        store
            .submit(JobInput::new(JobType::Image, "p").with_id("j"))
            .unwrap();
        store
            .advance("j", ProgressUpdate::new(JobState::Running, Step::Submission))
            .unwrap();
        store
            .advance("j", ProgressUpdate::new(JobState::WaitingCallback, Step::Polling))
            .unwrap();
        store
    }

    fn poll_attempts(store: &JobStore) -> usize {
        store
            .history("j")
            .unwrap()
            .iter()
            .filter(|e| e.kind == AuditEventKind::PollAttempt)
            .count()
    }

    #[tokio::test]
    async fn pending_then_completed() {
        let store = waiting_job();
        let provider = ScriptedProvider::new("p")
            .push_poll(Ok(PollStatus::Pending { percent: Some(30) }))
            .push_poll(Err(ProviderError::Transient("502".into())))
            .push_poll(Ok(PollStatus::Completed { result_url: "r".into() }));

        let event = PollingScheduler::new(fast_policy(5))
            .poll_until_resolved(&store, &provider, "j", "ref")
            .await
            .unwrap();

        assert_eq!(event, ResumeEvent::Completed { result_url: "r".into() });
        assert_eq!(poll_attempts(&store), 3);
        assert_eq!(store.get("j").unwrap().percent, 30);
    }

    #[tokio::test]
    async fn exhaustion_is_provider_timeout() {
        let store = waiting_job();
        let provider = ScriptedProvider::new("p").default_poll(PollStatus::Pending { percent: None });

        let err = PollingScheduler::new(fast_policy(3))
            .poll_until_resolved(&store, &provider, "j", "ref")
            .await
            .unwrap_err();

        assert_matches!(err, PipelineError::ProviderTimeout { attempts: 3 });
        assert_eq!(poll_attempts(&store), 3);
    }

    #[tokio::test]
    async fn permanent_error_stops_polling() {
        let store = waiting_job();
        let provider = ScriptedProvider::new("p")
            .push_poll(Err(ProviderError::Permanent("HTTP 404".into())));

        let err = PollingScheduler::new(fast_policy(10))
            .poll_until_resolved(&store, &provider, "j", "ref")
            .await
            .unwrap_err();

        assert_matches!(err, PipelineError::PermanentProvider(_));
        assert_eq!(poll_attempts(&store), 1);
    }

    #[tokio::test]
    async fn provider_failure_is_a_resume_event() {
        let store = waiting_job();
        let provider = ScriptedProvider::new("p").default_poll(PollStatus::Failed { error: "nsfw".into() });

        let event = PollingScheduler::new(fast_policy(3))
            .poll_until_resolved(&store, &provider, "j", "ref")
            .await
            .unwrap();
        assert_eq!(event, ResumeEvent::Failed { error: "nsfw".into() });
    }
}

//! Drives one job from admission to a terminal state.
//!
//! ```text
//! PENDING --admission--> RUNNING --register--> WAITING_CALLBACK
//!    WAITING_CALLBACK --callback | poll--> COMPLETED | FAILED
//!    WAITING_CALLBACK --transient submit error--> RETRYING --> RUNNING
//! ```
//!
//! The whole sequence races the job's cancellation token. Open tokens are
//! retired before the terminal transition is written. The admission ticket
//! is released before `CANCELLED` is written, and after `COMPLETED` or
//! `FAILED`, so a queued job is only admitted once its predecessor is
//! visibly finished.

use std::collections::HashMap;
use std::sync::Arc;

use genflow_core::audit::AuditEventKind;
use genflow_core::job::{JobState, JobType, Step};
use genflow_provider::{GenerationProvider, GenerationRequest, ProviderError, SubmitReceipt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::admission::{AdmissionController, AdmissionTicket};
use crate::config::PipelineConfig;
use crate::durable::{load_step, run_step, DurableContext};
use crate::error::PipelineError;
use crate::polling::PollingScheduler;
use crate::registry::{CorrelationRegistry, Registration, ResumeEvent};
use crate::store::{JobStore, ProgressUpdate};

// ---------------------------------------------------------------------------
// ProviderSet
// ---------------------------------------------------------------------------

/// Which provider handles each job type.
#[derive(Clone)]
pub struct ProviderSet {
    by_type: HashMap<JobType, Arc<dyn GenerationProvider>>,
}

impl ProviderSet {
    pub fn new(image: Arc<dyn GenerationProvider>, video: Arc<dyn GenerationProvider>) -> Self {
        let mut by_type = HashMap::new();
        by_type.insert(JobType::Image, image);
        by_type.insert(JobType::Video, video);
        Self { by_type }
    }

    /// One provider for every job type.
    pub fn uniform(provider: Arc<dyn GenerationProvider>) -> Self {
        Self::new(Arc::clone(&provider), provider)
    }

    pub fn for_type(&self, job_type: JobType) -> Result<Arc<dyn GenerationProvider>, PipelineError> {
        self.by_type
            .get(&job_type)
            .cloned()
            .ok_or_else(|| PipelineError::Internal(format!("no provider configured for {job_type}")))
    }

    /// Look a provider up by the name used in its callback URL.
    pub fn by_name(&self, name: &str) -> Option<Arc<dyn GenerationProvider>> {
        self.by_type.values().find(|p| p.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_type.values().map(|p| p.name().to_string()).collect();
        names.sort();
        names.dedup();
        names
    }
}

// ---------------------------------------------------------------------------
// JobRunner
// ---------------------------------------------------------------------------

/// Checkpointed outcome of one submission attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubmittedCall {
    correlation_token: String,
    receipt: SubmitReceipt,
}

/// The components a job needs while it runs.
pub struct JobRunner {
    pub(crate) store: Arc<JobStore>,
    pub(crate) admission: Arc<AdmissionController>,
    pub(crate) registry: Arc<CorrelationRegistry>,
    pub(crate) polling: PollingScheduler,
    pub(crate) providers: ProviderSet,
    pub(crate) durable: Arc<dyn DurableContext>,
    pub(crate) config: PipelineConfig,
}

impl JobRunner {
    /// Run `job_id` to completion, honouring `cancel` at every suspension
    /// point. Never returns an error: every outcome ends in a terminal
    /// state on the job record.
    pub async fn run(&self, job_id: &str, cancel: CancellationToken) {
        let mut ticket: Option<AdmissionTicket> = None;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            result = self.execute(job_id, &mut ticket) => result,
        };

        let cancelled = matches!(result, Err(PipelineError::Cancelled));
        if !matches!(result, Ok(ResumeEvent::Completed { .. })) {
            self.registry.retire_for_job(job_id);
        }
        if cancelled {
            self.release(job_id, &mut ticket);
        }

        let written = match result {
            Ok(ResumeEvent::Completed { result_url }) => self.store.complete(job_id, &result_url),
            Ok(ResumeEvent::Failed { error }) => self.store.fail(job_id, &error),
            Err(PipelineError::Cancelled) => Ok(false),
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Job execution failed");
                self.store.fail(job_id, &e.to_string())
            }
        };
        let written = written.unwrap_or_else(|e| {
            tracing::error!(job_id, error = %e, "Failed to record terminal state");
            false
        });
        self.release(job_id, &mut ticket);

        // Cancelled, or a result arrived after a cancellation was accepted.
        if !written && (cancelled || self.store.cancel_requested(job_id)) {
            self.cancel_remote(job_id).await;
            if let Err(e) = self.store.mark_cancelled(job_id, "cancelled by request") {
                tracing::error!(job_id, error = %e, "Failed to record cancellation");
            }
        }

        self.durable.forget(job_id).await;
    }

    /// Give back the admission slot, if one is held.
    fn release(&self, job_id: &str, ticket: &mut Option<AdmissionTicket>) {
        if let Some(ticket) = ticket.take() {
            ticket.release();
            if let Err(e) = self.store.record(
                job_id,
                AuditEventKind::AdmissionReleased,
                json!({ "outstanding": self.admission.outstanding() }),
            ) {
                tracing::warn!(job_id, error = %e, "Failed to record admission release");
            }
        }
    }

    /// Best-effort cancellation of provider-side work.
    async fn cancel_remote(&self, job_id: &str) {
        let Ok(job) = self.store.get(job_id) else {
            return;
        };
        let (Some(name), Some(provider_ref)) = (job.provider.as_deref(), job.provider_ref.as_deref()) else {
            return;
        };
        let Some(provider) = self.providers.by_name(name) else {
            return;
        };
        if let Err(e) = provider.cancel(provider_ref).await {
            tracing::warn!(job_id, provider_ref, error = %e, "Provider cancellation failed");
        }
    }

    async fn execute(
        &self,
        job_id: &str,
        ticket: &mut Option<AdmissionTicket>,
    ) -> Result<ResumeEvent, PipelineError> {
        let job = self.store.get(job_id)?;
        let provider = self.providers.for_type(job.job_type)?;

        self.store.report_progress(job_id, Step::Admission, None, "waiting for admission")?;
        let granted = self
            .admission
            .acquire(job_id, self.config.admission_timeout)
            .await?;
        *ticket = Some(granted);
        self.store.record(
            job_id,
            AuditEventKind::AdmissionGranted,
            json!({ "outstanding": self.admission.outstanding() }),
        )?;

        self.enter_running(job_id, "admitted")?;

        let policy = &self.config.submit_retry;
        let mut attempt = 1;
        loop {
            let step = format!("provider_submit#{attempt}");
            // A replayed submission resumes under the token the provider holds.
            let replayed: Option<SubmittedCall> = load_step(self.durable.as_ref(), job_id, &step).await;
            let Registration { token, mailbox } = match replayed {
                Some(call) => self.registry.register_with_token(job_id, call.correlation_token)?,
                None => self.registry.register(job_id)?,
            };
            let request = GenerationRequest {
                job_id: job.id.clone(),
                job_type: job.job_type,
                prompt: job.input.prompt.clone(),
                params: job.input.params.clone(),
                correlation_token: token.clone(),
                callback_url: self.config.callback_url(provider.name()),
            };

            let submitted = run_step(self.durable.as_ref(), job_id, &step, || async {
                let receipt = provider.submit(&request).await?;
                Ok::<_, ProviderError>(SubmittedCall {
                    correlation_token: token.clone(),
                    receipt,
                })
            })
            .await;

            match submitted {
                Ok(SubmittedCall { receipt, .. }) => {
                    self.store
                        .set_provider(job_id, provider.name(), &receipt.provider_ref)?;
                    return self
                        .await_resolution(job_id, &token, provider.as_ref(), &receipt, mailbox)
                        .await;
                }
                Err(ProviderError::Transient(message)) if attempt < policy.max_attempts => {
                    self.registry.retire(&token);
                    let delay = policy.delay_after(attempt);
                    tracing::warn!(
                        job_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Provider submission failed, retrying"
                    );
                    self.store.advance(
                        job_id,
                        ProgressUpdate::new(JobState::Retrying, Step::Submission)
                            .message(format!("provider unavailable: {message}")),
                    )?;
                    self.store.record(
                        job_id,
                        AuditEventKind::RetryScheduled,
                        json!({
                            "attempt": attempt,
                            "delay_ms": delay.as_millis() as u64,
                            "error": message,
                        }),
                    )?;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    self.enter_running(job_id, format!("submission attempt {attempt}"))?;
                }
                Err(ProviderError::Transient(message)) => {
                    return Err(PipelineError::TransientProvider {
                        attempts: attempt,
                        message,
                    });
                }
                Err(ProviderError::Permanent(message)) => {
                    return Err(PipelineError::PermanentProvider(message));
                }
            }
        }
    }

    fn enter_running(&self, job_id: &str, message: impl Into<String>) -> Result<(), PipelineError> {
        let applied = self.store.advance(
            job_id,
            ProgressUpdate::new(JobState::Running, Step::Submission).message(message),
        )?;
        if !applied {
            return Err(PipelineError::Conflict(format!("job {job_id} is already terminal")));
        }
        Ok(())
    }

    /// Wait for the callback, falling back to polling. The first to resolve
    /// wins; a poll result is only used if it can still claim the token.
    async fn await_resolution(
        &self,
        job_id: &str,
        token: &str,
        provider: &dyn GenerationProvider,
        receipt: &SubmitReceipt,
        mut mailbox: oneshot::Receiver<ResumeEvent>,
    ) -> Result<ResumeEvent, PipelineError> {
        let mut mailbox_open = true;

        if receipt.callback_supported {
            self.store.report_progress(
                job_id,
                Step::AwaitingCallback,
                None,
                "waiting for provider callback",
            )?;
            tokio::select! {
                delivered = &mut mailbox => match delivered {
                    Ok(event) => return Ok(event),
                    Err(_) => mailbox_open = false,
                },
                _ = tokio::time::sleep(self.config.callback_wait) => {
                    tracing::info!(job_id, token, "Callback not received in time, falling back to polling");
                }
            }
        }

        self.store
            .report_progress(job_id, Step::Polling, None, "checking provider status")?;
        let poll = self
            .polling
            .poll_until_resolved(&self.store, provider, job_id, &receipt.provider_ref);
        tokio::pin!(poll);

        loop {
            tokio::select! {
                biased;
                delivered = &mut mailbox, if mailbox_open => match delivered {
                    Ok(event) => return Ok(event),
                    Err(_) => mailbox_open = false,
                },
                polled = &mut poll => {
                    let event = polled?;
                    if self.registry.claim(token) {
                        return Ok(event);
                    }
                    // A callback consumed the token first and owns the result.
                    if mailbox_open {
                        if let Ok(event) = mailbox.await {
                            return Ok(event);
                        }
                    }
                    return Ok(event);
                }
            }
        }
    }
}

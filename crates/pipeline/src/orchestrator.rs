//! The orchestration facade.
//!
//! [`Orchestrator`] owns the job store, admission controller, correlation
//! registry and the background tasks that run jobs. It is cheap to clone
//! and meant to be shared by the HTTP layer and the batch orchestrator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use genflow_core::job::{Job, JobInput, JobState};
use genflow_core::types::{BatchId, JobId};
use genflow_events::EventBus;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admission::AdmissionController;
use crate::config::PipelineConfig;
use crate::durable::{DurableContext, InMemoryCheckpoints};
use crate::error::PipelineError;
use crate::polling::PollingScheduler;
use crate::query::ProgressQuery;
use crate::registry::CorrelationRegistry;
use crate::runner::{JobRunner, ProviderSet};
use crate::store::{JobStore, SubmitOptions};

struct Inner {
    runner: Arc<JobRunner>,
    bus: Arc<EventBus>,
    cancels: Mutex<HashMap<JobId, CancellationToken>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Build an orchestrator with process-local checkpoints.
    pub fn new(config: PipelineConfig, providers: ProviderSet, bus: Arc<EventBus>) -> Self {
        Self::with_durable(config, providers, bus, Arc::new(InMemoryCheckpoints::new()))
    }

    pub fn with_durable(
        config: PipelineConfig,
        providers: ProviderSet,
        bus: Arc<EventBus>,
        durable: Arc<dyn DurableContext>,
    ) -> Self {
        let store = Arc::new(JobStore::new(Arc::clone(&bus)));
        let admission = Arc::new(AdmissionController::new(config.max_concurrent_jobs));
        let registry = Arc::new(CorrelationRegistry::new(
            Arc::clone(&store),
            config.token_grace,
            config.token_max_staleness,
        ));
        let runner = JobRunner {
            store,
            admission,
            registry,
            polling: PollingScheduler::new(config.polling.clone()),
            providers,
            durable,
            config,
        };

        Self {
            inner: Arc::new(Inner {
                runner: Arc::new(runner),
                bus,
                cancels: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    fn cancels(&self) -> MutexGuard<'_, HashMap<JobId, CancellationToken>> {
        self.inner
            .cancels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the correlation-token sweeper.
    pub fn start_background(&self) {
        let registry = Arc::clone(&self.inner.runner.registry);
        let interval = self.inner.runner.config.token_sweep_interval;
        let cancel = self.inner.shutdown.child_token();
        self.inner
            .tracker
            .spawn(async move { registry.run_sweeper(interval, cancel).await });
    }

    /// Validate and record a job, then start running it.
    pub fn submit(&self, input: JobInput) -> Result<JobId, PipelineError> {
        self.submit_with(input, SubmitOptions::default(), &self.inner.shutdown)
    }

    /// Submit with provenance, cancelled together with `parent`.
    pub(crate) fn submit_with(
        &self,
        input: JobInput,
        options: SubmitOptions,
        parent: &CancellationToken,
    ) -> Result<JobId, PipelineError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(PipelineError::Conflict("orchestrator is shutting down".into()));
        }
        let job_id = self.inner.runner.store.submit_with(input, options)?;
        self.spawn(job_id.clone(), parent.child_token());
        Ok(job_id)
    }

    pub(crate) fn submit_in_batch(
        &self,
        input: JobInput,
        batch_id: &BatchId,
        parent: &CancellationToken,
    ) -> Result<JobId, PipelineError> {
        let options = SubmitOptions {
            batch_id: Some(batch_id.clone()),
            retry_of: None,
        };
        self.submit_with(input, options, parent)
    }

    fn spawn(&self, job_id: JobId, cancel: CancellationToken) {
        self.cancels().insert(job_id.clone(), cancel.clone());
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            this.inner.runner.run(&job_id, cancel).await;
            this.cancels().remove(&job_id);
        });
    }

    /// Request cooperative cancellation.
    ///
    /// Returns `false` when the job is already terminal. An accepted request
    /// always ends the job `CANCELLED`, even when a provider result lands
    /// before the job's current suspension point observes the request.
    pub fn cancel(&self, job_id: &str) -> Result<bool, PipelineError> {
        if !self.inner.runner.store.request_cancel(job_id)? {
            return Ok(false);
        }

        let token = self.cancels().get(job_id).cloned();
        match token {
            Some(token) => token.cancel(),
            None => {
                // No runner owns the job; finish it here.
                self.inner
                    .runner
                    .store
                    .mark_cancelled(job_id, "cancelled by request")?;
            }
        }
        tracing::info!(job_id, "Cancellation requested");
        Ok(true)
    }

    pub async fn wait_for_terminal(&self, job_id: &str) -> Result<Job, PipelineError> {
        Ok(self.inner.runner.store.wait_terminal(job_id).await?)
    }

    /// Resubmit a `FAILED` job's input as a new job linked by `retry_of`.
    pub fn retry(&self, job_id: &str) -> Result<JobId, PipelineError> {
        let job = self.inner.runner.store.get(job_id)?;
        if job.state != JobState::Failed {
            return Err(PipelineError::Conflict(format!(
                "only FAILED jobs can be retried, job {job_id} is {}",
                job.state
            )));
        }
        let mut input = job.input;
        input.id = None;
        let options = SubmitOptions {
            batch_id: None,
            retry_of: Some(job.id),
        };
        self.submit_with(input, options, &self.inner.shutdown)
    }

    /// Stop background work and cancel in-flight jobs, waiting at most
    /// `timeout` for their tasks to finish.
    pub async fn shutdown(&self, timeout: Duration) {
        tracing::info!("Orchestrator shutting down");
        self.inner.shutdown.cancel();
        self.inner.runner.admission.close();
        self.inner.tracker.close();
        if tokio::time::timeout(timeout, self.inner.tracker.wait()).await.is_err() {
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "Timed out waiting for job tasks to stop"
            );
        }
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    // ---- component accessors ----

    pub fn store(&self) -> &Arc<JobStore> {
        &self.inner.runner.store
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.inner.runner.admission
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.inner.runner.registry
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.inner.runner.providers
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.runner.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn query(&self) -> ProgressQuery {
        ProgressQuery::new(
            Arc::clone(self.store()),
            Arc::clone(self.admission()),
            Arc::clone(self.registry()),
        )
    }
}

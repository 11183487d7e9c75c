//! Job State Machine.
//!
//! [`JobStore`] owns every [`Job`] record together with its audit trail.
//! All mutations go through the transition graph in
//! [`genflow_core::state_machine`], append an audit event under the same
//! lock, and publish a [`JobEvent`] on the bus. Readers always see a job
//! and its history from the same instant.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use genflow_core::audit::{AuditEvent, AuditEventKind, AuditTrail};
use genflow_core::error::CoreError;
use genflow_core::job::{validate_job_input, Job, JobInput, JobState, JobType, Step};
use genflow_core::job_events;
use genflow_core::state_machine::validate_transition;
use genflow_core::types::{BatchId, JobId};
use genflow_events::{EventBus, JobEvent};
use serde_json::json;
use tokio::sync::watch;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// A non-terminal progress update.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub state: JobState,
    pub step: Step,
    pub percent: Option<u8>,
    pub message: Option<String>,
}

impl ProgressUpdate {
    pub fn new(state: JobState, step: Step) -> Self {
        Self {
            state,
            step,
            percent: None,
            message: None,
        }
    }

    pub fn percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent.min(100));
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Provenance recorded on a job at submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub batch_id: Option<BatchId>,
    pub retry_of: Option<JobId>,
}

/// Listing filter, already clamped by the caller.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub state: Option<JobState>,
    pub job_type: Option<JobType>,
    pub user_id: Option<String>,
    pub batch_id: Option<BatchId>,
    pub limit: usize,
    pub offset: usize,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct JobEntry {
    job: Job,
    trail: AuditTrail,
    state_tx: watch::Sender<JobState>,
    /// Set once a cancellation has been accepted. The job can then only
    /// end `CANCELLED`.
    cancel_requested: bool,
}

/// In-process job records and their audit trails.
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
    bus: Arc<EventBus>,
}

impl JobStore {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            bus,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate `input` and record a new `PENDING` job.
    pub fn submit(&self, input: JobInput) -> Result<JobId, CoreError> {
        self.submit_with(input, SubmitOptions::default())
    }

    pub fn submit_with(&self, input: JobInput, options: SubmitOptions) -> Result<JobId, CoreError> {
        validate_job_input(&input)?;
        let id = input
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let now = Utc::now();
        let mut job = Job::new(id.clone(), input, now);
        job.batch_id = options.batch_id;
        job.retry_of = options.retry_of;

        let mut trail = AuditTrail::new(id.clone());
        trail.append(
            AuditEventKind::Submitted,
            json!({
                "type": job.job_type,
                "user_id": job.input.user_id,
                "batch_id": job.batch_id,
                "retry_of": job.retry_of,
            }),
            now,
        );
        let event = JobEvent::new(job_events::JOB_SUBMITTED)
            .for_job(id.clone())
            .with_payload(json!({ "type": job.job_type, "state": job.state }));
        let event = match &job.batch_id {
            Some(batch_id) => event.for_batch(batch_id.clone()),
            None => event,
        };

        {
            let mut jobs = self.write();
            if jobs.contains_key(&id) {
                return Err(CoreError::Conflict(format!("job {id} already exists")));
            }
            let (state_tx, _) = watch::channel(JobState::Pending);
            jobs.insert(
                id.clone(),
                JobEntry {
                    job,
                    trail,
                    state_tx,
                    cancel_requested: false,
                },
            );
        }

        tracing::info!(job_id = %id, "Job submitted");
        self.bus.publish(event);
        Ok(id)
    }

    /// Apply a non-terminal update.
    ///
    /// A state change must be an edge of the transition graph; the same
    /// state is a plain progress update. Updates to a terminal job are
    /// recorded as rejected and return `Ok(false)`.
    pub fn advance(&self, job_id: &str, update: ProgressUpdate) -> Result<bool, CoreError> {
        if update.state.is_terminal() {
            return Err(CoreError::Validation(format!(
                "{} is set through complete, fail or cancel",
                update.state
            )));
        }

        let event = {
            let mut jobs = self.write();
            let entry = jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
            let now = Utc::now();

            if entry.job.is_terminal() {
                entry.trail.append(
                    AuditEventKind::UpdateRejected,
                    json!({
                        "current": entry.job.state,
                        "requested": update.state,
                        "step": update.step,
                    }),
                    now,
                );
                tracing::debug!(
                    job_id,
                    current = %entry.job.state,
                    requested = %update.state,
                    "Ignoring update to terminal job"
                );
                return Ok(false);
            }

            let from = entry.job.state;
            if from != update.state {
                validate_transition(from, update.state)?;
                if update.state == JobState::Retrying {
                    entry.job.retry_count += 1;
                }
                entry.job.state = update.state;
                entry.trail.append(
                    AuditEventKind::StateChanged,
                    json!({
                        "from": from,
                        "to": update.state,
                        "step": update.step,
                        "message": update.message,
                    }),
                    now,
                );
                entry.state_tx.send_replace(update.state);
            } else {
                entry.trail.append(
                    AuditEventKind::Progress,
                    json!({
                        "step": update.step,
                        "percent": update.percent,
                        "message": update.message,
                    }),
                    now,
                );
            }

            entry.job.step = update.step;
            if let Some(percent) = update.percent {
                entry.job.percent = percent;
            }
            if update.message.is_some() {
                entry.job.message = update.message;
            }
            entry.job.updated_at = now;

            job_event(&entry.job, job_events::JOB_PROGRESS)
        };

        self.bus.publish(event);
        Ok(true)
    }

    /// Record a progress change that keeps the current state.
    pub fn report_progress(
        &self,
        job_id: &str,
        step: Step,
        percent: Option<u8>,
        message: impl Into<String>,
    ) -> Result<bool, CoreError> {
        let state = self.get(job_id)?.state;
        if state.is_terminal() {
            return self.advance(job_id, ProgressUpdate::new(JobState::Running, step));
        }
        let mut update = ProgressUpdate::new(state, step).message(message);
        if let Some(percent) = percent {
            update = update.percent(percent);
        }
        self.advance(job_id, update)
    }

    /// Accept a cancellation for a non-terminal job.
    ///
    /// Returns `false` when the job is already terminal. Once accepted,
    /// [`complete`](Self::complete) and [`fail`](Self::fail) are refused, so
    /// the job's only remaining exit is [`mark_cancelled`](Self::mark_cancelled).
    pub fn request_cancel(&self, job_id: &str) -> Result<bool, CoreError> {
        let mut jobs = self.write();
        let entry = jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        if entry.job.is_terminal() {
            return Ok(false);
        }
        if !entry.cancel_requested {
            entry.cancel_requested = true;
            entry.trail.append(
                AuditEventKind::CancelRequested,
                json!({ "state": entry.job.state, "step": entry.job.step }),
                Utc::now(),
            );
        }
        Ok(true)
    }

    pub fn cancel_requested(&self, job_id: &str) -> bool {
        self.read().get(job_id).is_some_and(|entry| entry.cancel_requested)
    }

    /// `WAITING_CALLBACK -> COMPLETED`. A no-op on a terminal job.
    pub fn complete(&self, job_id: &str, result_ref: &str) -> Result<bool, CoreError> {
        self.finish(job_id, JobState::Completed, Some(result_ref.to_string()), None)
    }

    /// Any non-terminal state `-> FAILED`. A no-op on a terminal job.
    pub fn fail(&self, job_id: &str, error: &str) -> Result<bool, CoreError> {
        self.finish(job_id, JobState::Failed, None, Some(error.to_string()))
    }

    /// Any non-terminal state `-> CANCELLED`. A no-op on a terminal job.
    pub fn mark_cancelled(&self, job_id: &str, reason: &str) -> Result<bool, CoreError> {
        self.finish(job_id, JobState::Cancelled, None, Some(reason.to_string()))
    }

    fn finish(
        &self,
        job_id: &str,
        to: JobState,
        result_ref: Option<String>,
        error: Option<String>,
    ) -> Result<bool, CoreError> {
        let event = {
            let mut jobs = self.write();
            let entry = jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
            let from = entry.job.state;
            if from.is_terminal() {
                tracing::debug!(job_id, current = %from, requested = %to, "Job already terminal");
                return Ok(false);
            }
            if entry.cancel_requested && to != JobState::Cancelled {
                tracing::debug!(job_id, requested = %to, "Cancellation pending, result discarded");
                return Ok(false);
            }
            validate_transition(from, to)?;

            let now = Utc::now();
            entry.job.state = to;
            entry.job.step = Step::Finished;
            if to == JobState::Completed {
                entry.job.percent = 100;
            }
            entry.job.result_ref = result_ref;
            entry.job.error = error;
            entry.job.updated_at = now;
            entry.job.completed_at = Some(now);
            entry.trail.append(
                AuditEventKind::StateChanged,
                json!({
                    "from": from,
                    "to": to,
                    "result_ref": entry.job.result_ref,
                    "error": entry.job.error,
                }),
                now,
            );
            entry.state_tx.send_replace(to);

            let event_type = match to {
                JobState::Completed => job_events::JOB_COMPLETED,
                JobState::Failed => job_events::JOB_FAILED,
                _ => job_events::JOB_CANCELLED,
            };
            job_event(&entry.job, event_type)
        };

        match to {
            JobState::Failed => tracing::warn!(job_id, "Job failed"),
            _ => tracing::info!(job_id, state = %to, "Job finished"),
        }
        self.bus.publish(event);
        Ok(true)
    }

    /// Append an arbitrary audit event to a job's trail.
    pub fn record(
        &self,
        job_id: &str,
        kind: AuditEventKind,
        payload: serde_json::Value,
    ) -> Result<AuditEvent, CoreError> {
        let mut jobs = self.write();
        let entry = jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        Ok(entry.trail.append(kind, payload, Utc::now()))
    }

    /// Remember which provider accepted the job and under what reference.
    pub fn set_provider(&self, job_id: &str, provider: &str, provider_ref: &str) -> Result<(), CoreError> {
        let mut jobs = self.write();
        let entry = jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        entry.job.provider = Some(provider.to_string());
        entry.job.provider_ref = Some(provider_ref.to_string());
        Ok(())
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.read().contains_key(job_id)
    }

    pub fn get(&self, job_id: &str) -> Result<Job, CoreError> {
        self.read()
            .get(job_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| not_found(job_id))
    }

    /// The job and its full history, read under one lock.
    pub fn detailed(&self, job_id: &str) -> Result<(Job, Vec<AuditEvent>), CoreError> {
        self.read()
            .get(job_id)
            .map(|entry| (entry.job.clone(), entry.trail.events().to_vec()))
            .ok_or_else(|| not_found(job_id))
    }

    pub fn history(&self, job_id: &str) -> Result<Vec<AuditEvent>, CoreError> {
        self.detailed(job_id).map(|(_, history)| history)
    }

    pub fn subscribe(&self, job_id: &str) -> Result<watch::Receiver<JobState>, CoreError> {
        self.read()
            .get(job_id)
            .map(|entry| entry.state_tx.subscribe())
            .ok_or_else(|| not_found(job_id))
    }

    /// Wait until the job reaches a terminal state and return it.
    pub async fn wait_terminal(&self, job_id: &str) -> Result<Job, CoreError> {
        let mut rx = self.subscribe(job_id)?;
        // Entries are never removed, so the sender outlives this wait.
        rx.wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| CoreError::Internal(format!("state channel for job {job_id} closed")))?;
        self.get(job_id)
    }

    /// Jobs matching `filter`, newest first.
    pub fn list(&self, filter: &ListFilter) -> Vec<Job> {
        let jobs = self.read();
        let mut matched: Vec<&Job> = jobs
            .values()
            .map(|entry| &entry.job)
            .filter(|job| filter.state.map_or(true, |s| job.state == s))
            .filter(|job| filter.job_type.map_or(true, |t| job.job_type == t))
            .filter(|job| {
                filter
                    .user_id
                    .as_deref()
                    .map_or(true, |u| job.input.user_id.as_deref() == Some(u))
            })
            .filter(|job| {
                filter
                    .batch_id
                    .as_deref()
                    .map_or(true, |b| job.batch_id.as_deref() == Some(b))
            })
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        matched
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect()
    }

    /// Number of jobs in each state, including empty states.
    pub fn counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts: BTreeMap<&'static str, usize> =
            JobState::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        for entry in self.read().values() {
            *counts.entry(entry.job.state.as_str()).or_default() += 1;
        }
        counts
    }
}

fn not_found(job_id: &str) -> CoreError {
    CoreError::NotFound {
        entity: "job",
        id: job_id.to_string(),
    }
}

fn job_event(job: &Job, event_type: &str) -> JobEvent {
    let event = JobEvent::new(event_type).for_job(job.id.clone()).with_payload(json!({
        "state": job.state,
        "step": job.step,
        "percent": job.percent,
        "message": job.message,
        "result_ref": job.result_ref,
        "error": job.error,
        "webhook_url": job.input.webhook_url,
    }));
    match &job.batch_id {
        Some(batch_id) => event.for_batch(batch_id.clone()),
        None => event,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

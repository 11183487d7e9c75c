//! Batch Orchestrator.
//!
//! Runs a group of jobs under a parallel or sequential strategy and derives
//! the batch state from its members with
//! [`aggregate_state`](genflow_core::batch::aggregate_state).
//!
//! Members go through the normal job path, so each one still passes the
//! global admission controller. A parallel batch additionally caps how many
//! of its own members are in flight at once. Member job ids are fixed at
//! submission so the ordered member list exists before anything runs.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use genflow_core::batch::{
    aggregate_state, count_members, validate_batch_spec, BatchCounts, BatchSpec, BatchState,
    BatchStrategy, FailurePolicy,
};
use genflow_core::job::{JobInput, JobState};
use genflow_core::job_events;
use genflow_core::types::{BatchId, JobId, Timestamp};
use genflow_events::JobEvent;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::orchestrator::Orchestrator;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

struct BatchEntry {
    strategy: BatchStrategy,
    max_concurrent: usize,
    failure_policy: FailurePolicy,
    job_ids: Vec<JobId>,
    submitted: Vec<bool>,
    state: BatchState,
    created_at: Timestamp,
    updated_at: Timestamp,
    cancel: CancellationToken,
    done_tx: watch::Sender<bool>,
}

/// One member of a batch, in batch order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchMember {
    pub job_id: JobId,
    /// `None` until the member is submitted.
    pub state: Option<JobState>,
}

/// Read-only view of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub id: BatchId,
    pub strategy: BatchStrategy,
    pub max_concurrent: usize,
    pub failure_policy: FailurePolicy,
    pub state: BatchState,
    /// Whether the batch has stopped scheduling and every submitted member
    /// is terminal.
    pub finished: bool,
    pub members: Vec<BatchMember>,
    pub counts: BatchCounts,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BatchOrchestrator {
    orchestrator: Orchestrator,
    batches: Arc<RwLock<HashMap<BatchId, BatchEntry>>>,
}

impl BatchOrchestrator {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            batches: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<BatchId, BatchEntry>> {
        self.batches.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<BatchId, BatchEntry>> {
        self.batches.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate a batch, assign member ids and start scheduling it.
    pub fn submit_batch(&self, spec: BatchSpec) -> Result<BatchId, PipelineError> {
        validate_batch_spec(&spec)?;

        let batch_id = spec
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let store = self.orchestrator.store();
        let inputs: Vec<JobInput> = spec
            .jobs
            .into_iter()
            .map(|mut input| {
                input.id.get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
                input
            })
            .collect();
        let job_ids: Vec<JobId> = inputs.iter().filter_map(|i| i.id.clone()).collect();
        if let Some(taken) = job_ids.iter().find(|id| store.contains(id)) {
            return Err(PipelineError::Conflict(format!("job {taken} already exists")));
        }

        let member_count = inputs.len();
        let max_concurrent = spec.max_concurrent.unwrap_or(member_count).min(member_count);
        let cancel = self.orchestrator.shutdown_token().child_token();
        let now = Utc::now();
        {
            let mut batches = self.write();
            if batches.contains_key(&batch_id) {
                return Err(PipelineError::Conflict(format!("batch {batch_id} already exists")));
            }
            let (done_tx, _) = watch::channel(false);
            batches.insert(
                batch_id.clone(),
                BatchEntry {
                    strategy: spec.strategy,
                    max_concurrent,
                    failure_policy: spec.failure_policy,
                    job_ids,
                    submitted: vec![false; member_count],
                    state: BatchState::Pending,
                    created_at: now,
                    updated_at: now,
                    cancel: cancel.clone(),
                    done_tx,
                },
            );
        }

        tracing::info!(
            batch_id = %batch_id,
            members = member_count,
            strategy = ?spec.strategy,
            failure_policy = ?spec.failure_policy,
            "Batch submitted"
        );

        let this = self.clone();
        let driver_id = batch_id.clone();
        let strategy = spec.strategy;
        self.orchestrator.tracker().spawn(async move {
            match strategy {
                BatchStrategy::Parallel => {
                    this.run_parallel(&driver_id, inputs, max_concurrent, cancel).await
                }
                BatchStrategy::Sequential => this.run_sequential(&driver_id, inputs, cancel).await,
            }
            this.finish(&driver_id);
        });

        Ok(batch_id)
    }

    async fn run_parallel(
        &self,
        batch_id: &str,
        inputs: Vec<JobInput>,
        max_concurrent: usize,
        cancel: CancellationToken,
    ) {
        let limit = Arc::new(Semaphore::new(max_concurrent));
        let fail_fast = self.failure_policy(batch_id) == Some(FailurePolicy::FailFast);
        let total = inputs.len();
        let mut pending = inputs.into_iter().enumerate();
        let mut next = 0;
        let mut members: JoinSet<JobState> = JoinSet::new();

        loop {
            if next >= total && members.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                joined = members.join_next(), if !members.is_empty() => {
                    let state = joined.unwrap_or(Ok(JobState::Failed)).unwrap_or(JobState::Failed);
                    self.refresh(batch_id);
                    if fail_fast && state != JobState::Completed {
                        tracing::info!(batch_id, "Member did not complete, failing batch fast");
                        cancel.cancel();
                    }
                }
                permit = Arc::clone(&limit).acquire_owned(), if next < total => {
                    let Ok(permit) = permit else { break };
                    let Some((index, input)) = pending.next() else { break };
                    next += 1;
                    let Some(job_id) = self.submit_member(batch_id, index, input, &cancel) else {
                        if fail_fast {
                            cancel.cancel();
                        }
                        continue;
                    };
                    let orchestrator = self.orchestrator.clone();
                    members.spawn(async move {
                        // Hold the batch-local slot until the member is terminal.
                        let _permit = permit;
                        orchestrator
                            .wait_for_terminal(&job_id)
                            .await
                            .map(|job| job.state)
                            .unwrap_or(JobState::Failed)
                    });
                }
            }
        }

        // Cancelled siblings still have to reach a terminal state.
        while members.join_next().await.is_some() {
            self.refresh(batch_id);
        }
    }

    async fn run_sequential(&self, batch_id: &str, inputs: Vec<JobInput>, cancel: CancellationToken) {
        let fail_fast = self.failure_policy(batch_id) == Some(FailurePolicy::FailFast);

        for (index, input) in inputs.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let Some(job_id) = self.submit_member(batch_id, index, input, &cancel) else {
                if fail_fast {
                    break;
                }
                continue;
            };

            let state = self
                .orchestrator
                .wait_for_terminal(&job_id)
                .await
                .map(|job| job.state)
                .unwrap_or(JobState::Failed);
            self.refresh(batch_id);

            if fail_fast && state != JobState::Completed {
                tracing::info!(batch_id, job_id = %job_id, "Member did not complete, aborting sequence");
                break;
            }
        }
    }

    fn submit_member(
        &self,
        batch_id: &str,
        index: usize,
        input: JobInput,
        cancel: &CancellationToken,
    ) -> Option<JobId> {
        let batch_id = batch_id.to_string();
        match self.orchestrator.submit_in_batch(input, &batch_id, cancel) {
            Ok(job_id) => {
                if let Some(entry) = self.write().get_mut(&batch_id) {
                    entry.submitted[index] = true;
                }
                self.refresh(&batch_id);
                Some(job_id)
            }
            Err(e) => {
                tracing::error!(batch_id = %batch_id, index, error = %e, "Failed to submit batch member");
                None
            }
        }
    }

    fn failure_policy(&self, batch_id: &str) -> Option<FailurePolicy> {
        self.read().get(batch_id).map(|e| e.failure_policy)
    }

    /// Member states in batch order, `None` for unsubmitted members.
    fn member_states(&self, entry: &BatchEntry) -> Vec<Option<JobState>> {
        let store = self.orchestrator.store();
        entry
            .job_ids
            .iter()
            .zip(&entry.submitted)
            .map(|(id, submitted)| {
                if *submitted {
                    store.get(id).ok().map(|job| job.state)
                } else {
                    None
                }
            })
            .collect()
    }

    /// Recompute the aggregate state.
    fn refresh(&self, batch_id: &str) {
        let mut batches = self.write();
        let Some(entry) = batches.get_mut(batch_id) else {
            return;
        };
        let states = self.member_states(entry);
        let state = aggregate_state(entry.failure_policy, &states);
        if state != entry.state {
            entry.state = state;
            entry.updated_at = Utc::now();
        }
    }

    /// Settle the final state once scheduling has stopped.
    fn finish(&self, batch_id: &str) {
        let event = {
            let mut batches = self.write();
            let Some(entry) = batches.get_mut(batch_id) else {
                return;
            };
            let states = self.member_states(entry);
            let mut state = aggregate_state(entry.failure_policy, &states);
            // Members that were never submitted cannot complete.
            if !state.is_terminal() {
                state = BatchState::Failed;
            }
            entry.state = state;
            entry.updated_at = Utc::now();
            entry.done_tx.send_replace(true);

            let counts = count_members(&states);
            let event_type = match state {
                BatchState::Completed => job_events::BATCH_COMPLETED,
                _ => job_events::BATCH_FAILED,
            };
            tracing::info!(batch_id, state = %state, completed = counts.completed, total = counts.total, "Batch finished");
            JobEvent::new(event_type)
                .for_batch(batch_id.to_string())
                .with_payload(json!({ "state": state, "counts": counts }))
        };
        self.orchestrator.bus().publish(event);
    }

    pub fn get_batch(&self, batch_id: &str) -> Result<BatchSnapshot, PipelineError> {
        let batches = self.read();
        let entry = batches.get(batch_id).ok_or_else(|| not_found(batch_id))?;
        let states = self.member_states(entry);
        let finished = *entry.done_tx.borrow();
        Ok(BatchSnapshot {
            id: batch_id.to_string(),
            strategy: entry.strategy,
            max_concurrent: entry.max_concurrent,
            failure_policy: entry.failure_policy,
            state: entry.state,
            finished,
            members: entry
                .job_ids
                .iter()
                .zip(&states)
                .map(|(id, state)| BatchMember {
                    job_id: id.clone(),
                    state: *state,
                })
                .collect(),
            counts: count_members(&states),
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        })
    }

    /// Wait until the batch has finished and return its final snapshot.
    pub async fn wait_for_batch(&self, batch_id: &str) -> Result<BatchSnapshot, PipelineError> {
        let mut done = {
            let batches = self.read();
            let entry = batches.get(batch_id).ok_or_else(|| not_found(batch_id))?;
            entry.done_tx.subscribe()
        };
        // The sender lives in the entry, which is never removed.
        let _ = done.wait_for(|finished| *finished).await;
        self.get_batch(batch_id)
    }

    /// Cancel in-flight members and stop submitting the rest.
    ///
    /// Returns `false` when the batch has already finished.
    pub fn cancel_batch(&self, batch_id: &str) -> Result<bool, PipelineError> {
        let batches = self.read();
        let entry = batches.get(batch_id).ok_or_else(|| not_found(batch_id))?;
        if *entry.done_tx.borrow() {
            return Ok(false);
        }
        entry.cancel.cancel();
        tracing::info!(batch_id, "Batch cancellation requested");
        Ok(true)
    }
}

fn not_found(batch_id: &str) -> PipelineError {
    PipelineError::NotFound {
        entity: "batch",
        id: batch_id.to_string(),
    }
}

//! Progress Query Service.
//!
//! Read-only access to job progress, audit history, listings and
//! orchestration counters. Every call reads a consistent snapshot and
//! never mutates state.

use std::collections::BTreeMap;
use std::sync::Arc;

use genflow_core::audit::AuditEvent;
use genflow_core::job::{Job, JobState, JobType, ProgressSnapshot};
use genflow_core::types::{BatchId, JobId, Timestamp};
use serde::{Deserialize, Serialize};

use crate::admission::{AdmissionController, AdmissionStats};
use crate::error::PipelineError;
use crate::registry::{CorrelationRegistry, TokenStats};
use crate::store::{JobStore, ListFilter};

/// Default page size for [`ProgressQuery::list_jobs`].
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Largest page size a caller may ask for.
pub const MAX_LIST_LIMIT: usize = 100;

/// Caller-facing listing filter. Deserializable from a query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    pub state: Option<JobState>,
    #[serde(rename = "type")]
    pub job_type: Option<JobType>,
    pub user_id: Option<String>,
    pub batch_id: Option<BatchId>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Progress plus the job's full audit history.
#[derive(Debug, Clone, Serialize)]
pub struct DetailedStatus {
    #[serde(flatten)]
    pub progress: ProgressSnapshot,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub retry_count: u32,
    pub provider: Option<String>,
    pub provider_ref: Option<String>,
    pub retry_of: Option<JobId>,
    pub batch_id: Option<BatchId>,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub history: Vec<AuditEvent>,
}

/// Orchestration counters.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationStats {
    pub total_jobs: usize,
    pub jobs_by_state: BTreeMap<&'static str, usize>,
    pub admission: AdmissionStats,
    pub callbacks: TokenStats,
}

#[derive(Clone)]
pub struct ProgressQuery {
    store: Arc<JobStore>,
    admission: Arc<AdmissionController>,
    registry: Arc<CorrelationRegistry>,
}

impl ProgressQuery {
    pub fn new(
        store: Arc<JobStore>,
        admission: Arc<AdmissionController>,
        registry: Arc<CorrelationRegistry>,
    ) -> Self {
        Self {
            store,
            admission,
            registry,
        }
    }

    pub fn get_progress(&self, job_id: &str) -> Result<ProgressSnapshot, PipelineError> {
        Ok(self.store.get(job_id)?.progress())
    }

    pub fn get_detailed_status(&self, job_id: &str) -> Result<DetailedStatus, PipelineError> {
        let (job, history) = self.store.detailed(job_id)?;
        Ok(DetailedStatus {
            progress: job.progress(),
            job_type: job.job_type,
            retry_count: job.retry_count,
            provider: job.provider,
            provider_ref: job.provider_ref,
            retry_of: job.retry_of,
            batch_id: job.batch_id,
            created_at: job.created_at,
            completed_at: job.completed_at,
            history,
        })
    }

    /// Jobs matching `filter`, newest first. `limit` defaults to
    /// [`DEFAULT_LIST_LIMIT`] and is capped at [`MAX_LIST_LIMIT`].
    pub fn list_jobs(&self, filter: JobFilter) -> Vec<Job> {
        let list = ListFilter {
            state: filter.state,
            job_type: filter.job_type,
            user_id: filter.user_id,
            batch_id: filter.batch_id,
            limit: filter.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT),
            offset: filter.offset.unwrap_or(0),
        };
        self.store.list(&list)
    }

    pub fn stats(&self) -> OrchestrationStats {
        let jobs_by_state = self.store.counts();
        OrchestrationStats {
            total_jobs: jobs_by_state.values().sum(),
            jobs_by_state,
            admission: self.admission.stats(),
            callbacks: self.registry.stats(),
        }
    }
}

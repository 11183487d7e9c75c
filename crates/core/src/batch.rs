//! Batch policy types, batch validation, and the aggregate-state function.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job::{validate_job_id, validate_job_input, JobInput, JobState};
use crate::types::BatchId;

/// Maximum number of members a single batch may carry.
pub const MAX_BATCH_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// How batch members are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    /// Members are submitted together, bounded by the batch-local cap.
    Parallel,
    /// Member i+1 is submitted only after member i is terminal.
    Sequential,
}

/// What a non-`COMPLETED` member does to the rest of the batch.
///
/// Deliberately has no `Default`: callers must choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    FailFast,
    Continue,
}

/// Aggregate state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchState {
    /// No member has been submitted yet.
    Pending,
    Running,
    Completed,
    Failed,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Batch request
// ---------------------------------------------------------------------------

/// Submission payload for a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSpec {
    #[serde(default)]
    pub id: Option<BatchId>,
    pub strategy: BatchStrategy,
    /// Batch-local cap on members in flight; defaults to all members.
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    pub failure_policy: FailurePolicy,
    pub jobs: Vec<JobInput>,
}

/// Validate a batch and every member input.
pub fn validate_batch_spec(spec: &BatchSpec) -> Result<(), CoreError> {
    if let Some(id) = &spec.id {
        validate_job_id(id)?;
    }
    if spec.jobs.is_empty() {
        return Err(CoreError::Validation(
            "batch must contain at least one job".into(),
        ));
    }
    if spec.jobs.len() > MAX_BATCH_SIZE {
        return Err(CoreError::Validation(format!(
            "batch must not exceed {MAX_BATCH_SIZE} jobs"
        )));
    }
    if spec.max_concurrent == Some(0) {
        return Err(CoreError::Validation(
            "max_concurrent must be at least 1".into(),
        ));
    }

    let mut seen = HashSet::with_capacity(spec.jobs.len());
    for (i, input) in spec.jobs.iter().enumerate() {
        validate_job_input(input)
            .map_err(|e| CoreError::Validation(format!("jobs[{i}]: {e}")))?;
        if let Some(id) = &input.id {
            if !seen.insert(id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "jobs[{i}]: duplicate job id \"{id}\""
                )));
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

/// Derive a batch's state from its members.
///
/// `members` is in batch order; `None` marks a member that has not been
/// submitted (and, after a fail-fast abort, never will be).
///
/// - Fail-fast: any terminal non-`COMPLETED` member makes the batch `FAILED`.
/// - Otherwise the batch is `RUNNING` until every member is terminal, then
///   `COMPLETED` iff all members completed.
pub fn aggregate_state(policy: FailurePolicy, members: &[Option<JobState>]) -> BatchState {
    let submitted: Vec<JobState> = members.iter().flatten().copied().collect();

    let any_unsuccessful = submitted
        .iter()
        .any(|s| s.is_terminal() && *s != JobState::Completed);

    if policy == FailurePolicy::FailFast && any_unsuccessful {
        return BatchState::Failed;
    }
    if submitted.is_empty() {
        return BatchState::Pending;
    }

    let all_terminal = submitted.len() == members.len() && submitted.iter().all(|s| s.is_terminal());
    if !all_terminal {
        return BatchState::Running;
    }

    if any_unsuccessful {
        BatchState::Failed
    } else {
        BatchState::Completed
    }
}

/// Per-state member counts for a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub total: usize,
    pub not_submitted: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

pub fn count_members(members: &[Option<JobState>]) -> BatchCounts {
    let mut counts = BatchCounts {
        total: members.len(),
        ..Default::default()
    };
    for member in members {
        match member {
            None => counts.not_submitted += 1,
            Some(JobState::Completed) => counts.completed += 1,
            Some(JobState::Failed) => counts.failed += 1,
            Some(JobState::Cancelled) => counts.cancelled += 1,
            Some(_) => counts.in_flight += 1,
        }
    }
    counts
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;
    use JobState::*;

    fn spec(jobs: Vec<JobInput>) -> BatchSpec {
        BatchSpec {
            id: None,
            strategy: BatchStrategy::Parallel,
            max_concurrent: None,
            failure_policy: FailurePolicy::Continue,
            jobs,
        }
    }

    #[test]
    fn all_completed_is_completed() {
        let members = [Some(Completed), Some(Completed)];
        assert_eq!(aggregate_state(FailurePolicy::FailFast, &members), BatchState::Completed);
        assert_eq!(aggregate_state(FailurePolicy::Continue, &members), BatchState::Completed);
    }

    #[test]
    fn nothing_submitted_is_pending() {
        assert_eq!(aggregate_state(FailurePolicy::Continue, &[None, None]), BatchState::Pending);
    }

    #[test]
    fn fail_fast_fails_immediately() {
        let members = [Some(Failed), Some(Running), None];
        assert_eq!(aggregate_state(FailurePolicy::FailFast, &members), BatchState::Failed);
    }

    #[test]
    fn fail_fast_treats_cancelled_as_failure() {
        let members = [Some(Completed), Some(Cancelled)];
        assert_eq!(aggregate_state(FailurePolicy::FailFast, &members), BatchState::Failed);
    }

    #[test]
    fn continue_waits_for_all_members() {
        let members = [Some(Failed), Some(WaitingCallback)];
        assert_eq!(aggregate_state(FailurePolicy::Continue, &members), BatchState::Running);

        let members = [Some(Failed), Some(Completed)];
        assert_eq!(aggregate_state(FailurePolicy::Continue, &members), BatchState::Failed);
    }

    #[test]
    fn continue_with_unsubmitted_member_is_running() {
        let members = [Some(Completed), None];
        assert_eq!(aggregate_state(FailurePolicy::Continue, &members), BatchState::Running);
    }

    #[test]
    fn counts_by_bucket() {
        let counts = count_members(&[None, Some(Running), Some(Completed), Some(Cancelled)]);
        assert_eq!(counts.total, 4);
        assert_eq!(counts.not_submitted, 1);
        assert_eq!(counts.in_flight, 1);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.cancelled, 1);
    }

    #[test]
    fn empty_batch_rejected() {
        assert!(validate_batch_spec(&spec(vec![])).is_err());
    }

    #[test]
    fn member_errors_are_indexed() {
        let jobs = vec![
            JobInput::new(JobType::Image, "ok"),
            JobInput::new(JobType::Video, "no duration"),
        ];
        let err = validate_batch_spec(&spec(jobs)).unwrap_err();
        assert!(err.to_string().contains("jobs[1]"));
    }

    #[test]
    fn duplicate_member_ids_rejected() {
        let jobs = vec![
            JobInput::new(JobType::Image, "a").with_id("same"),
            JobInput::new(JobType::Image, "b").with_id("same"),
        ];
        assert!(validate_batch_spec(&spec(jobs)).is_err());
    }

    #[test]
    fn failure_policy_is_required() {
        let result: Result<BatchSpec, _> = serde_json::from_value(serde_json::json!({
            "strategy": "parallel",
            "jobs": [{ "type": "IMAGE", "prompt": "p" }]
        }));
        assert!(result.is_err());
    }
}

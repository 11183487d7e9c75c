//! Event type names published on the event bus for job and batch
//! lifecycle changes.
//!
//! Used by the pipeline when publishing and by the journal and webhook
//! notifier when filtering.

/// A job was accepted and recorded as `PENDING`.
pub const JOB_SUBMITTED: &str = "job.submitted";

/// A non-terminal state or progress change.
pub const JOB_PROGRESS: &str = "job.progress";

/// Job completed successfully.
pub const JOB_COMPLETED: &str = "job.completed";

/// Job failed with an error.
pub const JOB_FAILED: &str = "job.failed";

/// Job was cancelled (by a caller or by a fail-fast batch).
pub const JOB_CANCELLED: &str = "job.cancelled";

/// Every member of a batch completed.
pub const BATCH_COMPLETED: &str = "batch.completed";

/// A batch ended with at least one unsuccessful member.
pub const BATCH_FAILED: &str = "batch.failed";

/// Whether an event type marks the end of a job's lifecycle.
pub fn is_terminal_job_event(event_type: &str) -> bool {
    matches!(event_type, JOB_COMPLETED | JOB_FAILED | JOB_CANCELLED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_job_events() {
        assert!(is_terminal_job_event(JOB_COMPLETED));
        assert!(is_terminal_job_event(JOB_CANCELLED));
        assert!(!is_terminal_job_event(JOB_PROGRESS));
        assert!(!is_terminal_job_event(BATCH_FAILED));
    }
}

//! Job lifecycle transition graph.
//!
//! ```text
//! PENDING -> RUNNING -> WAITING_CALLBACK -> COMPLETED
//!               ^  \          |
//!               |   v         v
//!               +-- RETRYING <+
//!
//! any non-terminal -> FAILED | CANCELLED
//! ```
//!
//! Progress updates that keep the current state are not transitions and
//! are handled by the caller.

use crate::error::CoreError;
use crate::job::JobState;

/// Whether `from -> to` is an edge of the lifecycle graph.
pub fn can_transition(from: JobState, to: JobState) -> bool {
    use JobState::*;

    if from.is_terminal() {
        return false;
    }

    match (from, to) {
        (_, Failed | Cancelled) => true,
        (Pending, Running) => true,
        (Running, WaitingCallback) => true,
        (Running | WaitingCallback, Retrying) => true,
        (Retrying, Running) => true,
        (WaitingCallback, Completed) => true,
        _ => false,
    }
}

/// Check an edge, returning [`CoreError::InvalidTransition`] when absent.
pub fn validate_transition(from: JobState, to: JobState) -> Result<(), CoreError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition { from, to })
    }
}

/// States reachable in one step from `from`.
pub fn successors(from: JobState) -> Vec<JobState> {
    JobState::ALL
        .into_iter()
        .filter(|to| can_transition(from, *to))
        .collect()
}

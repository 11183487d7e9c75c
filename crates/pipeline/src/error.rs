use std::time::Duration;

use genflow_core::error::CoreError;

use crate::admission::AdmissionError;

/// Failures surfaced by the orchestration pipeline.
///
/// The `Display` text of the job-terminating variants becomes the job's
/// `error_message`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Admission timed out after {}s: concurrency limit exhausted", .waited.as_secs())]
    AdmissionTimeout { waited: Duration },

    #[error("Provider still unavailable after {attempts} attempts: {message}")]
    TransientProvider { attempts: u32, message: String },

    #[error("Provider rejected the request: {0}")]
    PermanentProvider(String),

    #[error("Provider did not resolve the job after {attempts} status checks")]
    ProviderTimeout { attempts: u32 },

    #[error("Callback mismatch: {0}")]
    CallbackMismatch(String),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<CoreError> for PipelineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            CoreError::Validation(msg) => Self::Validation(msg),
            CoreError::Conflict(msg) => Self::Conflict(msg),
            e @ CoreError::InvalidTransition { .. } => Self::Conflict(e.to_string()),
            CoreError::Internal(msg) => Self::Internal(msg),
        }
    }
}

impl From<AdmissionError> for PipelineError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Timeout { waited } => Self::AdmissionTimeout { waited },
            AdmissionError::Closed => Self::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genflow_core::job::JobState;

    #[test]
    fn invalid_transition_is_conflict() {
        let err: PipelineError = CoreError::InvalidTransition {
            from: JobState::Completed,
            to: JobState::Running,
        }
        .into();
        assert!(matches!(err, PipelineError::Conflict(m) if m.contains("COMPLETED")));
    }

    #[test]
    fn admission_timeout_message_names_resource() {
        let err = PipelineError::AdmissionTimeout {
            waited: Duration::from_secs(300),
        };
        assert_eq!(
            err.to_string(),
            "Admission timed out after 300s: concurrency limit exhausted"
        );
    }
}

//! Job records, submission input, and input validation.
//!
//! A [`Job`] is owned by the pipeline's job store and only mutated through
//! the transitions defined in [`crate::state_machine`]. Everything here is
//! plain data plus pure validation so it can be reused at the HTTP
//! boundary.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{BatchId, JobId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum prompt length in characters.
pub const MAX_PROMPT_LEN: usize = 500;

/// Maximum length of a caller-supplied job id.
pub const MAX_JOB_ID_LEN: usize = 128;

/// Inclusive bounds for `params.width` / `params.height`.
pub const MIN_DIMENSION: u64 = 64;
pub const MAX_DIMENSION: u64 = 4096;

/// Inclusive bounds for `params.duration` (seconds) on video jobs.
pub const MIN_VIDEO_DURATION_SECS: u64 = 1;
pub const MAX_VIDEO_DURATION_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kind of asset a job generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    #[serde(alias = "image")]
    Image,
    #[serde(alias = "video")]
    Video,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "IMAGE",
            Self::Video => "VIDEO",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a job.
///
/// `Pending` is the only initial state; `Completed`, `Failed` and
/// `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    WaitingCallback,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Every state, in declaration order.
    pub const ALL: [JobState; 7] = [
        JobState::Pending,
        JobState::Running,
        JobState::WaitingCallback,
        JobState::Retrying,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::WaitingCallback => "WAITING_CALLBACK",
            Self::Retrying => "RETRYING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse position of a job inside its execution sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Created, not yet asking for a concurrency slot.
    Queued,
    /// Waiting on the admission controller.
    Admission,
    /// Calling the provider.
    Submission,
    /// Waiting for the provider's webhook.
    AwaitingCallback,
    /// Checking provider status on a backoff schedule.
    Polling,
    /// Reached a terminal state.
    Finished,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Admission => "admission",
            Self::Submission => "submission",
            Self::AwaitingCallback => "awaiting_callback",
            Self::Polling => "polling",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Submission payload for a generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    /// Caller-chosen id. Generated when absent.
    #[serde(default)]
    pub id: Option<JobId>,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub prompt: String,
    /// Provider-specific parameters (`width`, `height`, `duration`, ...).
    #[serde(default = "empty_params")]
    pub params: serde_json::Value,
    /// Where to POST the terminal notification, if anywhere.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn empty_params() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

impl JobInput {
    /// Minimal input with empty params; mostly useful in tests and tools.
    pub fn new(job_type: JobType, prompt: impl Into<String>) -> Self {
        Self {
            id: None,
            job_type,
            prompt: prompt.into(),
            params: empty_params(),
            webhook_url: None,
            user_id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_webhook(mut self, url: impl Into<String>) -> Self {
        self.webhook_url = Some(url.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Validate a submission.
///
/// Rules:
/// - `prompt` is 1..=[`MAX_PROMPT_LEN`] characters after trimming.
/// - `id`, when given, is 1..=[`MAX_JOB_ID_LEN`] characters of
///   alphanumerics, `-`, `_` or `.`.
/// - `params` is a JSON object; `width`/`height` are integers in
///   [`MIN_DIMENSION`]..=[`MAX_DIMENSION`].
/// - Video jobs carry an integer `duration`; image jobs must not.
/// - `webhook_url`, when given, is an `http(s)` URL.
pub fn validate_job_input(input: &JobInput) -> Result<(), CoreError> {
    if let Some(id) = &input.id {
        validate_job_id(id)?;
    }

    let prompt = input.prompt.trim();
    if prompt.is_empty() {
        return Err(CoreError::Validation("prompt must not be empty".into()));
    }
    if prompt.chars().count() > MAX_PROMPT_LEN {
        return Err(CoreError::Validation(format!(
            "prompt must not exceed {MAX_PROMPT_LEN} characters"
        )));
    }

    let params = input
        .params
        .as_object()
        .ok_or_else(|| CoreError::Validation("params must be a JSON object".into()))?;

    for field in ["width", "height"] {
        if let Some(value) = params.get(field) {
            check_int_range(field, value, MIN_DIMENSION, MAX_DIMENSION)?;
        }
    }

    match (input.job_type, params.get("duration")) {
        (JobType::Video, None) => {
            return Err(CoreError::Validation(
                "duration is required for video jobs".into(),
            ));
        }
        (JobType::Video, Some(value)) => {
            check_int_range(
                "duration",
                value,
                MIN_VIDEO_DURATION_SECS,
                MAX_VIDEO_DURATION_SECS,
            )?;
        }
        (JobType::Image, Some(_)) => {
            return Err(CoreError::Validation(
                "duration must not be set for image jobs".into(),
            ));
        }
        (JobType::Image, None) => {}
    }

    if let Some(url) = &input.webhook_url {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(CoreError::Validation(
                "webhook_url must be an http(s) URL".into(),
            ));
        }
    }

    Ok(())
}

/// Validate a job or batch identifier.
pub fn validate_job_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() {
        return Err(CoreError::Validation("id must not be empty".into()));
    }
    if id.len() > MAX_JOB_ID_LEN {
        return Err(CoreError::Validation(format!(
            "id must not exceed {MAX_JOB_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::Validation(
            "id may only contain alphanumeric, hyphen, underscore, or dot characters".into(),
        ));
    }
    Ok(())
}

fn check_int_range(
    field: &str,
    value: &serde_json::Value,
    min: u64,
    max: u64,
) -> Result<(), CoreError> {
    match value.as_u64() {
        Some(n) if (min..=max).contains(&n) => Ok(()),
        _ => Err(CoreError::Validation(format!(
            "{field} must be an integer between {min} and {max}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

/// The tracked lifecycle of one generation request.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub input: JobInput,
    pub state: JobState,
    pub step: Step,
    /// Completion percentage (0-100).
    pub percent: u8,
    pub message: Option<String>,
    /// Asset reference returned by the provider on success.
    pub result_ref: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    /// Name of the provider handling the job, once known.
    pub provider: Option<String>,
    /// Provider-side request id used for polling and cancellation.
    pub provider_ref: Option<String>,
    /// The failed job this one was resubmitted from.
    pub retry_of: Option<JobId>,
    pub batch_id: Option<BatchId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl Job {
    /// Create a fresh `PENDING` job. The id must already be resolved.
    pub fn new(id: JobId, input: JobInput, now: Timestamp) -> Self {
        Self {
            id,
            job_type: input.job_type,
            input,
            state: JobState::Pending,
            step: Step::Queued,
            percent: 0,
            message: None,
            result_ref: None,
            error: None,
            retry_count: 0,
            provider: None,
            provider_ref: None,
            retry_of: None,
            batch_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn progress(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            job_id: self.id.clone(),
            step: self.step,
            status: self.state,
            percent: self.percent,
            message: self.message.clone(),
            asset_url: self.result_ref.clone(),
            error_message: self.error.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Read-only progress view returned by the query service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub job_id: JobId,
    pub step: Step,
    pub status: JobState,
    pub percent: u8,
    pub message: Option<String>,
    pub asset_url: Option<String>,
    pub error_message: Option<String>,
    pub updated_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn image() -> JobInput {
        JobInput::new(JobType::Image, "a lighthouse at dusk")
    }

    fn video(duration: serde_json::Value) -> JobInput {
        JobInput::new(JobType::Video, "waves").with_params(json!({ "duration": duration }))
    }

    #[test]
    fn minimal_image_input_is_valid() {
        assert!(validate_job_input(&image()).is_ok());
    }

    #[test]
    fn blank_prompt_rejected() {
        let input = JobInput::new(JobType::Image, "   ");
        let err = validate_job_input(&input).unwrap_err();
        assert!(err.to_string().contains("prompt"));
    }

    #[test]
    fn overlong_prompt_rejected() {
        let input = JobInput::new(JobType::Image, "x".repeat(MAX_PROMPT_LEN + 1));
        assert!(validate_job_input(&input).is_err());
    }

    #[test]
    fn video_requires_duration() {
        let input = JobInput::new(JobType::Video, "waves");
        let err = validate_job_input(&input).unwrap_err();
        assert!(err.to_string().contains("duration is required"));
    }

    #[test]
    fn video_duration_bounds() {
        assert!(validate_job_input(&video(json!(5))).is_ok());
        assert!(validate_job_input(&video(json!(0))).is_err());
        assert!(validate_job_input(&video(json!(61))).is_err());
        assert!(validate_job_input(&video(json!("5"))).is_err());
    }

    #[test]
    fn image_rejects_duration() {
        let input = image().with_params(json!({ "duration": 5 }));
        assert!(validate_job_input(&input).is_err());
    }

    #[test]
    fn dimensions_checked() {
        assert!(validate_job_input(&image().with_params(json!({ "width": 1024 }))).is_ok());
        assert!(validate_job_input(&image().with_params(json!({ "height": 32 }))).is_err());
        assert!(validate_job_input(&image().with_params(json!({ "width": 8192 }))).is_err());
    }

    #[test]
    fn params_must_be_object() {
        let input = image().with_params(json!([1, 2]));
        assert!(validate_job_input(&input).is_err());
    }

    #[test]
    fn job_id_charset() {
        assert!(validate_job_input(&image().with_id("job-1.a_b")).is_ok());
        assert!(validate_job_input(&image().with_id("job 1")).is_err());
        assert!(validate_job_input(&image().with_id("")).is_err());
    }

    #[test]
    fn webhook_scheme_checked() {
        assert!(validate_job_input(&image().with_webhook("https://example.com/hook")).is_ok());
        assert!(validate_job_input(&image().with_webhook("ftp://example.com")).is_err());
    }

    #[test]
    fn input_deserializes_with_type_field() {
        let input: JobInput = serde_json::from_value(json!({
            "type": "VIDEO",
            "prompt": "waves",
            "params": { "duration": 5 }
        }))
        .unwrap();
        assert_eq!(input.job_type, JobType::Video);
        assert!(input.id.is_none());

        let lower: JobInput =
            serde_json::from_value(json!({ "type": "image", "prompt": "p" })).unwrap();
        assert_eq!(lower.job_type, JobType::Image);
        assert!(lower.params.is_object());
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = JobState::ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal,
            vec![&JobState::Completed, &JobState::Failed, &JobState::Cancelled]
        );
    }

    #[test]
    fn state_serializes_screaming_snake() {
        let value = serde_json::to_value(JobState::WaitingCallback).unwrap();
        assert_eq!(value, "WAITING_CALLBACK");
        assert_eq!(JobState::WaitingCallback.to_string(), "WAITING_CALLBACK");
    }
}

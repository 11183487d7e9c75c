//! Inbound callback bodies.
//!
//! Providers POST `{external_request_id, status, result_url?, error?}` to
//! `/callback/{provider}`. The `external_request_id` is the correlation
//! token handed to the provider at submission.

use serde::{Deserialize, Serialize};

/// Raw callback body as received on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub external_request_id: String,
    pub status: String,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Optional 0-100 progress for in-flight notifications.
    #[serde(default)]
    pub progress: Option<u8>,
}

/// What a callback means for the waiting job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Completed { result_url: String },
    Failed { error: String },
    InProgress { percent: Option<u8> },
}

impl CallbackOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CallbackParseError {
    #[error("Malformed callback body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Callback is missing external_request_id")]
    MissingToken,

    #[error("Unrecognised callback status \"{0}\"")]
    UnknownStatus(String),
}

/// Coarse meaning of a provider status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusClass {
    Success,
    Failure,
    InProgress,
}

/// Map a provider status string to its class, case-insensitively.
pub(crate) fn classify_status(status: &str) -> Option<StatusClass> {
    match status.trim().to_ascii_lowercase().as_str() {
        "success" | "succeeded" | "succeed" | "completed" | "complete" | "done" => {
            Some(StatusClass::Success)
        }
        "failed" | "failure" | "error" | "cancelled" | "canceled" | "rejected" => {
            Some(StatusClass::Failure)
        }
        "pending" | "queued" | "submitted" | "processing" | "running" | "in_progress" => {
            Some(StatusClass::InProgress)
        }
        _ => None,
    }
}

impl CallbackPayload {
    /// Parse and sanity-check a raw request body.
    pub fn parse(body: &[u8]) -> Result<Self, CallbackParseError> {
        let payload: Self = serde_json::from_slice(body)?;
        if payload.external_request_id.trim().is_empty() {
            return Err(CallbackParseError::MissingToken);
        }
        Ok(payload)
    }

    /// Translate the provider's status into a job outcome.
    ///
    /// A success without a `result_url` has nothing to complete with and
    /// is treated as a failure.
    pub fn outcome(&self) -> Result<CallbackOutcome, CallbackParseError> {
        match classify_status(&self.status) {
            Some(StatusClass::Success) => match self.result_url.as_deref() {
                Some(url) if !url.trim().is_empty() => Ok(CallbackOutcome::Completed {
                    result_url: url.to_string(),
                }),
                _ => Ok(CallbackOutcome::Failed {
                    error: "provider reported success without a result_url".into(),
                }),
            },
            Some(StatusClass::Failure) => Ok(CallbackOutcome::Failed {
                error: self
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("provider reported status \"{}\"", self.status)),
            }),
            Some(StatusClass::InProgress) => Ok(CallbackOutcome::InProgress {
                percent: self.progress.map(|p| p.min(100)),
            }),
            None => Err(CallbackParseError::UnknownStatus(self.status.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn success_with_result_completes() {
        let payload =
            CallbackPayload::parse(br#"{"external_request_id":"T","status":"success","result_url":"r1"}"#)
                .unwrap();
        assert_eq!(
            payload.outcome().unwrap(),
            CallbackOutcome::Completed { result_url: "r1".into() }
        );
    }

    #[test]
    fn success_without_result_is_failure() {
        let payload =
            CallbackPayload::parse(br#"{"external_request_id":"T","status":"completed"}"#).unwrap();
        assert_matches!(payload.outcome(), Ok(CallbackOutcome::Failed { .. }));
    }

    #[test]
    fn failure_carries_provider_error() {
        let payload = CallbackPayload::parse(
            br#"{"external_request_id":"T","status":"FAILED","error":"nsfw filter"}"#,
        )
        .unwrap();
        assert_eq!(
            payload.outcome().unwrap(),
            CallbackOutcome::Failed { error: "nsfw filter".into() }
        );
    }

    #[test]
    fn progress_is_clamped() {
        let payload = CallbackPayload::parse(
            br#"{"external_request_id":"T","status":"processing","progress":250}"#,
        )
        .unwrap();
        assert_eq!(
            payload.outcome().unwrap(),
            CallbackOutcome::InProgress { percent: Some(100) }
        );
    }

    #[test]
    fn unknown_status_is_rejected() {
        let payload =
            CallbackPayload::parse(br#"{"external_request_id":"T","status":"weird"}"#).unwrap();
        assert_matches!(payload.outcome(), Err(CallbackParseError::UnknownStatus(s)) if s == "weird");
    }

    #[test]
    fn blank_token_is_rejected() {
        assert_matches!(
            CallbackPayload::parse(br#"{"external_request_id":"  ","status":"success"}"#),
            Err(CallbackParseError::MissingToken)
        );
        assert_matches!(
            CallbackPayload::parse(b"not json"),
            Err(CallbackParseError::Malformed(_))
        );
    }
}

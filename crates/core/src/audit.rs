//! Append-only per-job audit history.
//!
//! Each job owns one [`AuditTrail`]. Events are numbered by a per-job
//! monotonic sequence starting at 1 and are never mutated once appended;
//! the sequence order is the only source of truth for reconstructing what
//! happened to a job.

use serde::{Deserialize, Serialize};

use crate::types::{JobId, SequenceNo, Timestamp};

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// What an [`AuditEvent`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    Submitted,
    StateChanged,
    Progress,
    AdmissionGranted,
    AdmissionReleased,
    TokenRegistered,
    TokenRetired,
    CallbackReceived,
    DuplicateCallback,
    PollAttempt,
    RetryScheduled,
    CancelRequested,
    UpdateRejected,
}

impl AuditEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::StateChanged => "state_changed",
            Self::Progress => "progress",
            Self::AdmissionGranted => "admission_granted",
            Self::AdmissionReleased => "admission_released",
            Self::TokenRegistered => "token_registered",
            Self::TokenRetired => "token_retired",
            Self::CallbackReceived => "callback_received",
            Self::DuplicateCallback => "duplicate_callback",
            Self::PollAttempt => "poll_attempt",
            Self::RetryScheduled => "retry_scheduled",
            Self::CancelRequested => "cancel_requested",
            Self::UpdateRejected => "update_rejected",
        }
    }
}

/// One immutable entry in a job's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub job_id: JobId,
    pub sequence: SequenceNo,
    pub timestamp: Timestamp,
    pub kind: AuditEventKind,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Trail
// ---------------------------------------------------------------------------

/// Ordered, append-only event list for a single job.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    job_id: JobId,
    events: Vec<AuditEvent>,
}

impl AuditTrail {
    pub fn new(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            events: Vec::new(),
        }
    }

    /// Append an event and return a copy of it.
    ///
    /// The payload is passed through [`redact_sensitive_fields`] first.
    pub fn append(
        &mut self,
        kind: AuditEventKind,
        payload: serde_json::Value,
        timestamp: Timestamp,
    ) -> AuditEvent {
        let event = AuditEvent {
            job_id: self.job_id.clone(),
            sequence: self.last_sequence() + 1,
            timestamp,
            kind,
            payload: redact_sensitive_fields(&payload),
        };
        self.events.push(event.clone());
        event
    }

    /// Sequence number of the newest event, or 0 when empty.
    pub fn last_sequence(&self) -> SequenceNo {
        self.events.last().map_or(0, |e| e.sequence)
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Sensitive field redaction
// ---------------------------------------------------------------------------

/// Keys whose values never reach the audit history.
pub const SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "token",
    "secret",
    "api_key",
    "apikey",
    "private_key",
    "authorization",
    "credential",
];

/// Replace the value of any key containing a [`SENSITIVE_FIELDS`] entry
/// with `"[REDACTED]"`, recursing into nested objects and arrays.
///
/// `correlation_token` is exempt: it is the registry's public handle and
/// is needed to trace callbacks.
pub fn redact_sensitive_fields(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, val) in map {
                let lower_key = key.to_lowercase();
                let sensitive = lower_key != "correlation_token"
                    && SENSITIVE_FIELDS.iter().any(|f| lower_key.contains(f));
                if sensitive {
                    redacted.insert(
                        key.clone(),
                        serde_json::Value::String("[REDACTED]".to_string()),
                    );
                } else {
                    redacted.insert(key.clone(), redact_sensitive_fields(val));
                }
            }
            serde_json::Value::Object(redacted)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(redact_sensitive_fields).collect())
        }
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn sequence_starts_at_one_and_increases() {
        let mut trail = AuditTrail::new("job-1");
        assert_eq!(trail.last_sequence(), 0);

        let first = trail.append(AuditEventKind::Submitted, json!({}), Utc::now());
        let second = trail.append(AuditEventKind::StateChanged, json!({}), Utc::now());

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        assert_eq!(trail.len(), 2);
        assert_eq!(trail.events()[1].job_id, "job-1");
    }

    #[test]
    fn payload_is_redacted_on_append() {
        let mut trail = AuditTrail::new("job-1");
        let event = trail.append(
            AuditEventKind::Submitted,
            json!({ "params": { "api_key": "sk-123", "width": 512 } }),
            Utc::now(),
        );
        assert_eq!(event.payload["params"]["api_key"], "[REDACTED]");
        assert_eq!(event.payload["params"]["width"], 512);
    }

    #[test]
    fn correlation_token_is_kept() {
        let value = json!({ "correlation_token": "abc", "auth_token": "xyz" });
        let redacted = redact_sensitive_fields(&value);
        assert_eq!(redacted["correlation_token"], "abc");
        assert_eq!(redacted["auth_token"], "[REDACTED]");
    }

    #[test]
    fn redaction_recurses_into_arrays() {
        let value = json!([{ "password": "hunter2" }, 3]);
        let redacted = redact_sensitive_fields(&value);
        assert_eq!(redacted[0]["password"], "[REDACTED]");
        assert_eq!(redacted[1], 3);
    }

    #[test]
    fn kind_serializes_snake_case() {
        let value = serde_json::to_value(AuditEventKind::DuplicateCallback).unwrap();
        assert_eq!(value, AuditEventKind::DuplicateCallback.as_str());
    }
}

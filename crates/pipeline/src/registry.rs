//! Callback Correlation Registry.
//!
//! Maps correlation tokens to the job awaiting them. Each registration
//! hands the runner a one-shot mailbox; a terminal callback consumes the
//! token and sends exactly one [`ResumeEvent`] into that mailbox. Every
//! lookup and consume happens under one mutex, so two deliveries for the
//! same token can never both resume the job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use genflow_core::audit::AuditEventKind;
use genflow_core::job::{JobState, Step};
use genflow_core::types::{JobId, Timestamp};
use genflow_provider::callback::{CallbackOutcome, CallbackPayload};
use serde::Serialize;
use serde_json::json;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::store::{JobStore, ProgressUpdate};

/// Terminal result handed to a waiting job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeEvent {
    Completed { result_url: String },
    Failed { error: String },
}

/// What happened to a callback delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The token was consumed and the job resumed.
    Resumed,
    /// The token was already consumed; nothing changed.
    Duplicate,
    /// A non-terminal status; progress recorded, token still open.
    InProgress,
    /// No such token (orphan callback).
    NotFound,
}

/// A freshly issued token and the mailbox its resume event will land in.
#[derive(Debug)]
pub struct Registration {
    pub token: String,
    pub mailbox: oneshot::Receiver<ResumeEvent>,
}

struct TokenEntry {
    job_id: JobId,
    issued_at: Timestamp,
    consumed_at: Option<Timestamp>,
    mailbox: Option<oneshot::Sender<ResumeEvent>>,
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, Serialize)]
pub struct TokenStats {
    pub active_tokens: usize,
    pub retained_tokens: usize,
    pub orphan_callbacks: u64,
    pub duplicate_callbacks: u64,
}

pub struct CorrelationRegistry {
    tokens: Mutex<HashMap<String, TokenEntry>>,
    store: Arc<JobStore>,
    grace: Duration,
    max_staleness: Duration,
    orphans: AtomicU64,
    duplicates: AtomicU64,
}

impl CorrelationRegistry {
    pub fn new(store: Arc<JobStore>, grace: Duration, max_staleness: Duration) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            store,
            grace,
            max_staleness,
            orphans: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TokenEntry>> {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Issue a token for `job_id` and move the job to `WAITING_CALLBACK`.
    ///
    /// Called immediately before the provider is invoked so that a callback
    /// racing the provider's own response still finds its waiter.
    pub fn register(&self, job_id: &str) -> Result<Registration, PipelineError> {
        self.register_with_token(job_id, uuid::Uuid::new_v4().to_string())
    }

    /// Register a token issued earlier, such as one restored from a
    /// submission checkpoint that the provider already holds. Any previous
    /// entry for the token is replaced with a fresh mailbox.
    pub fn register_with_token(
        &self,
        job_id: &str,
        token: impl Into<String>,
    ) -> Result<Registration, PipelineError> {
        let token = token.into();
        let applied = self.store.advance(
            job_id,
            ProgressUpdate::new(JobState::WaitingCallback, Step::Submission)
                .message("submitting to provider"),
        )?;
        if !applied {
            return Err(PipelineError::Conflict(format!("job {job_id} is already terminal")));
        }

        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            token.clone(),
            TokenEntry {
                job_id: job_id.to_string(),
                issued_at: Utc::now(),
                consumed_at: None,
                mailbox: Some(tx),
            },
        );
        self.store
            .record(job_id, AuditEventKind::TokenRegistered, json!({ "correlation_token": token }))?;

        tracing::debug!(job_id, token = %token, "Correlation token registered");
        Ok(Registration { token, mailbox: rx })
    }

    /// Route a provider callback to the job holding `payload.external_request_id`.
    pub fn deliver(&self, payload: &CallbackPayload) -> Result<DeliveryOutcome, PipelineError> {
        let token = payload.external_request_id.as_str();
        let mut tokens = self.lock();

        let Some(entry) = tokens.get_mut(token) else {
            drop(tokens);
            self.orphans.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(token, status = %payload.status, "Orphan callback, no job holds this token");
            return Ok(DeliveryOutcome::NotFound);
        };
        let job_id = entry.job_id.clone();

        if entry.consumed_at.is_some() {
            drop(tokens);
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            self.store.record(
                &job_id,
                AuditEventKind::DuplicateCallback,
                json!({ "correlation_token": token, "status": payload.status }),
            )?;
            tracing::info!(job_id = %job_id, token, "Duplicate callback ignored");
            return Ok(DeliveryOutcome::Duplicate);
        }

        let outcome = match payload.outcome() {
            Ok(outcome) => outcome,
            Err(e) => {
                drop(tokens);
                self.store.record(
                    &job_id,
                    AuditEventKind::CallbackReceived,
                    json!({ "correlation_token": token, "status": payload.status, "rejected": e.to_string() }),
                )?;
                tracing::warn!(job_id = %job_id, token, error = %e, "Callback mismatch");
                return Err(PipelineError::CallbackMismatch(e.to_string()));
            }
        };

        let event = match outcome {
            CallbackOutcome::InProgress { percent } => {
                drop(tokens);
                self.store.report_progress(
                    &job_id,
                    Step::AwaitingCallback,
                    percent,
                    format!("provider reported {}", payload.status),
                )?;
                return Ok(DeliveryOutcome::InProgress);
            }
            CallbackOutcome::Completed { result_url } => ResumeEvent::Completed { result_url },
            CallbackOutcome::Failed { error } => ResumeEvent::Failed { error },
        };

        entry.consumed_at = Some(Utc::now());
        let mailbox = entry.mailbox.take();
        drop(tokens);

        self.store.record(
            &job_id,
            AuditEventKind::CallbackReceived,
            json!({ "correlation_token": token, "status": payload.status }),
        )?;

        let undelivered = match mailbox {
            Some(tx) => tx.send(event).err(),
            None => Some(event),
        };
        // The runner is gone; apply the result directly.
        if let Some(event) = undelivered {
            self.apply(&job_id, event)?;
        }

        tracing::info!(job_id = %job_id, token, "Callback resumed job");
        Ok(DeliveryOutcome::Resumed)
    }

    fn apply(&self, job_id: &str, event: ResumeEvent) -> Result<(), PipelineError> {
        match event {
            ResumeEvent::Completed { result_url } => self.store.complete(job_id, &result_url)?,
            ResumeEvent::Failed { error } => self.store.fail(job_id, &error)?,
        };
        Ok(())
    }

    /// Consume `token` on behalf of a poll result.
    ///
    /// Returns `false` when a callback already consumed it, in which case
    /// the poll lost the race and must not be applied.
    pub fn claim(&self, token: &str) -> bool {
        let mut tokens = self.lock();
        match tokens.get_mut(token) {
            Some(entry) if entry.consumed_at.is_none() => {
                entry.consumed_at = Some(Utc::now());
                entry.mailbox = None;
                true
            }
            _ => false,
        }
    }

    /// Close a token without resuming anyone. Later callbacks for it are
    /// recorded as duplicates.
    pub fn retire(&self, token: &str) {
        let job_id = {
            let mut tokens = self.lock();
            match tokens.get_mut(token) {
                Some(entry) if entry.consumed_at.is_none() => {
                    entry.consumed_at = Some(Utc::now());
                    entry.mailbox = None;
                    entry.job_id.clone()
                }
                _ => return,
            }
        };
        if let Err(e) = self.store.record(
            &job_id,
            AuditEventKind::TokenRetired,
            json!({ "correlation_token": token }),
        ) {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to record token retirement");
        }
    }

    /// Retire every open token belonging to `job_id`.
    pub fn retire_for_job(&self, job_id: &str) {
        let open: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, e)| e.job_id == job_id && e.consumed_at.is_none())
            .map(|(t, _)| t.clone())
            .collect();
        for token in open {
            self.retire(&token);
        }
    }

    /// The open token of `job_id`, if any.
    pub fn token_for_job(&self, job_id: &str) -> Option<String> {
        self.lock()
            .iter()
            .find(|(_, e)| e.job_id == job_id && e.consumed_at.is_none())
            .map(|(t, _)| t.clone())
    }

    pub fn is_consumed(&self, token: &str) -> Option<bool> {
        self.lock().get(token).map(|e| e.consumed_at.is_some())
    }

    /// Drop consumed tokens past the grace period and open tokens past the
    /// maximum staleness. Returns how many were removed.
    pub fn evict_expired(&self, now: Timestamp) -> usize {
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::MAX);
        let staleness =
            chrono::Duration::from_std(self.max_staleness).unwrap_or(chrono::Duration::MAX);

        let mut tokens = self.lock();
        let before = tokens.len();
        tokens.retain(|token, entry| {
            let keep = match entry.consumed_at {
                Some(consumed) => now - consumed <= grace,
                None => now - entry.issued_at <= staleness,
            };
            if !keep && entry.consumed_at.is_none() {
                tracing::warn!(job_id = %entry.job_id, token = %token, "Evicting stale unconsumed token");
            }
            keep
        });
        before - tokens.len()
    }

    /// Periodically evict expired tokens until `cancel` fires.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        tracing::info!(interval_secs = interval.as_secs(), "Token sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Token sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let evicted = self.evict_expired(Utc::now());
                    if evicted > 0 {
                        tracing::debug!(evicted, "Evicted expired correlation tokens");
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> TokenStats {
        let tokens = self.lock();
        let active = tokens.values().filter(|e| e.consumed_at.is_none()).count();
        TokenStats {
            active_tokens: active,
            retained_tokens: tokens.len() - active,
            orphan_callbacks: self.orphans.load(Ordering::Relaxed),
            duplicate_callbacks: self.duplicates.load(Ordering::Relaxed),
        }
    }
}

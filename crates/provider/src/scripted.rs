//! In-process provider with scripted behaviour.
//!
//! Used by the API binary when no provider URL is configured, and by tests
//! that need exact control over submission failures and poll results.
//! Callbacks are never pushed by this provider itself; tests deliver them
//! through the correlation registry using the tokens recorded in
//! [`ScriptedProvider::submitted`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::ProviderError;
use crate::provider::{GenerationProvider, GenerationRequest, PollStatus, SubmitReceipt};

/// A provider whose responses come from queues filled by the caller.
pub struct ScriptedProvider {
    name: String,
    callbacks: bool,
    submit_delay: Duration,
    submit_failures: Mutex<VecDeque<ProviderError>>,
    poll_script: Mutex<VecDeque<Result<PollStatus, ProviderError>>>,
    default_poll: Option<PollStatus>,
    submitted: Mutex<Vec<GenerationRequest>>,
    cancelled: Mutex<Vec<String>>,
    next_ref: AtomicU64,
    submissions_tx: watch::Sender<usize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedProvider {
    /// A polling-only provider whose polls complete immediately.
    pub fn new(name: impl Into<String>) -> Self {
        let (submissions_tx, _) = watch::channel(0);
        Self {
            name: name.into(),
            callbacks: false,
            submit_delay: Duration::ZERO,
            submit_failures: Mutex::new(VecDeque::new()),
            poll_script: Mutex::new(VecDeque::new()),
            default_poll: None,
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            next_ref: AtomicU64::new(1),
            submissions_tx,
        }
    }

    /// Report callback support on every receipt.
    pub fn with_callbacks(mut self, callbacks: bool) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Sleep this long inside every `submit` call.
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    /// Fail the next `submit` call with `err`. Queued failures are consumed
    /// in order before submissions start succeeding.
    pub fn fail_submit_with(self, err: ProviderError) -> Self {
        lock(&self.submit_failures).push_back(err);
        self
    }

    /// Queue one poll result.
    pub fn push_poll(self, result: Result<PollStatus, ProviderError>) -> Self {
        lock(&self.poll_script).push_back(result);
        self
    }

    /// Result returned once the poll queue is drained. Without one, polls
    /// complete with a synthetic `memory://` result URL.
    pub fn default_poll(mut self, status: PollStatus) -> Self {
        self.default_poll = Some(status);
        self
    }

    /// Every successfully accepted request, in submission order.
    pub fn submitted(&self) -> Vec<GenerationRequest> {
        lock(&self.submitted).clone()
    }

    /// Provider refs passed to `cancel`.
    pub fn cancelled(&self) -> Vec<String> {
        lock(&self.cancelled).clone()
    }

    /// Wait until at least `count` requests have been accepted.
    pub async fn wait_for_submissions(&self, count: usize) {
        let mut rx = self.submissions_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<SubmitReceipt, ProviderError> {
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }
        if let Some(err) = lock(&self.submit_failures).pop_front() {
            tracing::debug!(provider = %self.name, job_id = %request.job_id, error = %err, "Scripted submit failure");
            return Err(err);
        }

        let provider_ref = format!("{}-{}", self.name, self.next_ref.fetch_add(1, Ordering::Relaxed));
        let count = {
            let mut submitted = lock(&self.submitted);
            submitted.push(request.clone());
            submitted.len()
        };
        self.submissions_tx.send_replace(count);

        Ok(SubmitReceipt {
            provider_ref,
            callback_supported: self.callbacks && request.callback_url.is_some(),
        })
    }

    async fn poll(&self, provider_ref: &str) -> Result<PollStatus, ProviderError> {
        if let Some(result) = lock(&self.poll_script).pop_front() {
            return result;
        }
        Ok(self.default_poll.clone().unwrap_or_else(|| PollStatus::Completed {
            result_url: format!("memory://{}/{provider_ref}", self.name),
        }))
    }

    async fn cancel(&self, provider_ref: &str) -> Result<(), ProviderError> {
        lock(&self.cancelled).push(provider_ref.to_string());
        Ok(())
    }
}

//! Checkpointed step execution.
//!
//! [`DurableContext`] is the seam to whatever substrate persists workflow
//! steps. [`run_step`] returns a step's checkpointed result when one exists
//! instead of executing it again, so a replayed job never repeats a side
//! effect such as a provider submission.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[async_trait]
pub trait DurableContext: Send + Sync {
    async fn load_checkpoint(&self, job_id: &str, step: &str) -> Option<serde_json::Value>;

    async fn save_checkpoint(&self, job_id: &str, step: &str, value: serde_json::Value);

    /// Discard every checkpoint of a finished job.
    async fn forget(&self, job_id: &str) {
        let _ = job_id;
    }
}

/// The checkpointed result of `step`, if one exists and still decodes.
pub async fn load_step<T>(ctx: &dyn DurableContext, job_id: &str, step: &str) -> Option<T>
where
    T: DeserializeOwned,
{
    let saved = ctx.load_checkpoint(job_id, step).await?;
    match serde_json::from_value(saved) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(job_id, step, error = %e, "Discarding unreadable checkpoint");
            None
        }
    }
}

/// Run `f` once per `(job_id, step)`.
///
/// Only successful results are checkpointed; a failed step runs again on
/// the next call.
pub async fn run_step<T, E, F, Fut>(
    ctx: &dyn DurableContext,
    job_id: &str,
    step: &str,
    f: F,
) -> Result<T, E>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if let Some(value) = load_step(ctx, job_id, step).await {
        tracing::debug!(job_id, step, "Replaying checkpointed step");
        return Ok(value);
    }

    let value = f().await?;
    match serde_json::to_value(&value) {
        Ok(saved) => ctx.save_checkpoint(job_id, step, saved).await,
        Err(e) => tracing::warn!(job_id, step, error = %e, "Step result not checkpointed"),
    }
    Ok(value)
}

/// Process-local checkpoints.
#[derive(Default)]
pub struct InMemoryCheckpoints {
    steps: Mutex<HashMap<(String, String), serde_json::Value>>,
}

impl InMemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), serde_json::Value>> {
        self.steps.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[async_trait]
impl DurableContext for InMemoryCheckpoints {
    async fn load_checkpoint(&self, job_id: &str, step: &str) -> Option<serde_json::Value> {
        self.lock().get(&(job_id.to_string(), step.to_string())).cloned()
    }

    async fn save_checkpoint(&self, job_id: &str, step: &str, value: serde_json::Value) {
        self.lock().insert((job_id.to_string(), step.to_string()), value);
    }

    async fn forget(&self, job_id: &str) {
        self.lock().retain(|(job, _), _| job != job_id);
    }
}

//! Admission Controller.
//!
//! A global bounded resource guarding how many jobs may hold a slot at
//! once. Backed by a fair `tokio::sync::Semaphore`, so waiters are served
//! in arrival order. A slot is represented by an [`AdmissionTicket`] that
//! gives the slot back when released or dropped, which makes release on
//! every exit path (completion, failure, cancellation, panic) automatic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use genflow_core::types::{JobId, Timestamp};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdmissionError {
    #[error("Admission timed out after {waited:?}")]
    Timeout { waited: Duration },

    /// The controller was closed during shutdown.
    #[error("Admission controller is closed")]
    Closed,
}

/// Shared bookkeeping between the controller and outstanding tickets.
#[derive(Default)]
struct Holders {
    by_job: Mutex<HashMap<JobId, Timestamp>>,
    peak: AtomicUsize,
}

impl Holders {
    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, Timestamp>> {
        self.by_job.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub capacity: usize,
    pub outstanding: usize,
    pub peak: usize,
}

/// Global concurrency gate.
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    holders: Arc<Holders>,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            holders: Arc::new(Holders::default()),
        }
    }

    /// Wait for a free slot, at most `timeout`.
    pub async fn acquire(&self, job_id: &str, timeout: Duration) -> Result<AdmissionTicket, AdmissionError> {
        let permit = match tokio::time::timeout(timeout, Arc::clone(&self.semaphore).acquire_owned()).await {
            Err(_) => {
                tracing::warn!(job_id, timeout_secs = timeout.as_secs(), "Admission timed out");
                return Err(AdmissionError::Timeout { waited: timeout });
            }
            Ok(Err(_)) => return Err(AdmissionError::Closed),
            Ok(Ok(permit)) => permit,
        };

        let acquired_at = Utc::now();
        let outstanding = {
            let mut holders = self.holders.lock();
            let previous = holders.insert(job_id.to_string(), acquired_at);
            debug_assert!(previous.is_none(), "job {job_id} acquired a second ticket");
            holders.len()
        };
        self.holders.peak.fetch_max(outstanding, Ordering::SeqCst);

        tracing::debug!(job_id, outstanding, capacity = self.capacity, "Admission granted");

        Ok(AdmissionTicket {
            job_id: job_id.to_string(),
            acquired_at,
            holders: Arc::clone(&self.holders),
            _permit: permit,
        })
    }

    /// Stop admitting. Current and future waiters fail with
    /// [`AdmissionError::Closed`]; held tickets stay valid.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tickets currently held.
    pub fn outstanding(&self) -> usize {
        self.holders.lock().len()
    }

    /// Highest number of tickets ever held at once.
    pub fn peak(&self) -> usize {
        self.holders.peak.load(Ordering::SeqCst)
    }

    pub fn is_holding(&self, job_id: &str) -> bool {
        self.holders.lock().contains_key(job_id)
    }

    pub fn holders(&self) -> Vec<JobId> {
        self.holders.lock().keys().cloned().collect()
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            capacity: self.capacity,
            outstanding: self.outstanding(),
            peak: self.peak(),
        }
    }
}

/// Proof that a job holds one concurrency slot.
///
/// The slot is returned exactly once, when the ticket is released or
/// dropped. The holder entry is removed before the permit goes back to the
/// semaphore, so the holder count never exceeds capacity.
pub struct AdmissionTicket {
    job_id: JobId,
    acquired_at: Timestamp,
    holders: Arc<Holders>,
    // Dropped after `Drop::drop` runs.
    _permit: OwnedSemaphorePermit,
}

impl AdmissionTicket {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn acquired_at(&self) -> Timestamp {
        self.acquired_at
    }

    /// Give the slot back now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.holders.lock().remove(&self.job_id);
        tracing::debug!(job_id = %self.job_id, "Admission released");
    }
}

impl std::fmt::Debug for AdmissionTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionTicket")
            .field("job_id", &self.job_id)
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn acquire_and_release() {
        let controller = AdmissionController::new(1);
        let ticket = controller.acquire("a", LONG).await.unwrap();
        assert_eq!(ticket.job_id(), "a");
        assert_eq!(controller.outstanding(), 1);
        assert!(controller.is_holding("a"));

        ticket.release();
        assert_eq!(controller.outstanding(), 0);
        assert!(!controller.is_holding("a"));
    }

    #[tokio::test]
    async fn timeout_when_full() {
        let controller = AdmissionController::new(1);
        let _held = controller.acquire("a", LONG).await.unwrap();
        let err = controller
            .acquire("b", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_matches!(err, AdmissionError::Timeout { .. });
        assert!(!controller.is_holding("b"));
    }

    #[tokio::test]
    async fn drop_releases_slot_to_waiter() {
        let controller = Arc::new(AdmissionController::new(1));
        let held = controller.acquire("a", LONG).await.unwrap();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.acquire("b", LONG).await.map(|t| t.job_id().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), "b");
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let controller = Arc::new(AdmissionController::new(1));
        let held = controller.acquire("first", LONG).await.unwrap();
        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

        for name in ["w1", "w2", "w3"] {
            let controller = Arc::clone(&controller);
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let ticket = controller.acquire(name, LONG).await.unwrap();
                order_tx.send(name).unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                ticket.release();
            });
            // Let the waiter enqueue before the next one arrives.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(order_tx);
        drop(held);

        let mut order = Vec::new();
        while let Some(name) = order_rx.recv().await {
            order.push(name);
        }
        assert_eq!(order, vec!["w1", "w2", "w3"]);
    }

    #[tokio::test]
    async fn peak_never_exceeds_capacity() {
        let controller = Arc::new(AdmissionController::new(3));
        let mut handles = Vec::new();
        for i in 0..20 {
            let controller = Arc::clone(&controller);
            handles.push(tokio::spawn(async move {
                let ticket = controller.acquire(&format!("j{i}"), LONG).await.unwrap();
                assert!(controller.outstanding() <= 3);
                tokio::time::sleep(Duration::from_millis(2)).await;
                ticket.release();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(controller.peak() <= 3);
        assert!(controller.peak() >= 1);
        assert_eq!(controller.outstanding(), 0);
    }

    #[tokio::test]
    async fn close_fails_waiters() {
        let controller = Arc::new(AdmissionController::new(1));
        let _held = controller.acquire("a", LONG).await.unwrap();
        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.acquire("b", LONG).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.close();
        assert_matches!(waiter.await.unwrap(), Err(AdmissionError::Closed));
    }
}

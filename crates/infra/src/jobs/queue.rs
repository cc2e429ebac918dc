//! Hand-off of job ids from submission to workers.
//!
//! The queue carries ids only. Delivery is at-least-once: a delivery that is
//! not acked within the visibility timeout becomes deliverable again, so a
//! crashed worker never strands a job. Duplicates are expected and resolved
//! by the store's compare-and-swap, never here.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use gitgauge_core::JobId;

/// One handed-out id. `receipt` identifies this delivery for `ack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub job_id: JobId,
    pub receipt: String,
    /// 1 on first delivery, incremented on every redelivery.
    pub delivery_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("malformed queue entry: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError>;

    /// Wait up to `wait` for a delivery.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Mark a delivery as handled so it is never redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

#[async_trait]
impl<T> JobQueue for Arc<T>
where
    T: JobQueue + ?Sized,
{
    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError> {
        (**self).enqueue(job_id).await
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        (**self).dequeue(wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).ack(delivery).await
    }
}

#[derive(Debug)]
struct InFlight {
    job_id: JobId,
    delivery_count: u32,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    /// (id, deliveries so far)
    ready: VecDeque<(JobId, u32)>,
    in_flight: HashMap<u64, InFlight>,
    next_receipt: u64,
}

impl QueueState {
    /// Move expired in-flight deliveries back to the front of the line.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some(f) = self.in_flight.remove(&receipt) {
                warn!(job_id = %f.job_id, delivery_count = f.delivery_count, "delivery not acked in time, redelivering");
                self.ready.push_front((f.job_id, f.delivery_count));
            }
        }
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.in_flight.values().map(|f| f.visible_at).min()
    }
}

/// Process-local queue with visibility-timeout redelivery.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl InMemoryJobQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// Ids waiting for pickup (in-flight deliveries excluded).
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job_id: JobId) -> Result<(), QueueError> {
        self.state.lock().await.ready.push_back((job_id, 0));
        self.notify.notify_one();
        debug!(job_id = %job_id, "enqueued");
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.reclaim_expired(now);

                if let Some((job_id, previous)) = state.ready.pop_front() {
                    let receipt = state.next_receipt;
                    state.next_receipt += 1;
                    let delivery_count = previous + 1;
                    state.in_flight.insert(
                        receipt,
                        InFlight {
                            job_id,
                            delivery_count,
                            visible_at: now + self.visibility_timeout,
                        },
                    );
                    return Ok(Some(Delivery {
                        job_id,
                        receipt: receipt.to_string(),
                        delivery_count,
                    }));
                }

                if now >= deadline {
                    return Ok(None);
                }
                state.next_visible_at().map_or(deadline, |at| at.min(deadline))
            };

            // Either an enqueue wakes us or we re-check at the next expiry/deadline.
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let receipt: u64 = delivery
            .receipt
            .parse()
            .map_err(|_| QueueError::Malformed(format!("receipt `{}`", delivery.receipt)))?;
        // Acking an expired (already redelivered) receipt is a no-op.
        self.state.lock().await.in_flight.remove(&receipt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let queue = InMemoryJobQueue::default();
        let (a, b) = (JobId::new(), JobId::new());
        queue.enqueue(a).await.unwrap();
        queue.enqueue(b).await.unwrap();

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!((first.job_id, second.job_id), (a, b));
        assert_eq!(first.delivery_count, 1);
        assert!(queue.dequeue(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn waiting_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryJobQueue::default());
        let id = JobId::new();
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(id).await.unwrap();
        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.job_id, id);
    }

    #[tokio::test]
    async fn unacked_delivery_is_redelivered() {
        let queue = InMemoryJobQueue::new(Duration::from_millis(30));
        let id = JobId::new();
        queue.enqueue(id).await.unwrap();

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        let again = queue.dequeue(Duration::from_millis(500)).await.unwrap().unwrap();
        assert_eq!(again.job_id, first.job_id);
        assert_eq!(again.delivery_count, 2);
        assert_ne!(again.receipt, first.receipt);

        queue.ack(&again).await.unwrap();
        assert_eq!(queue.in_flight_len().await, 0);
        assert!(queue.dequeue(Duration::from_millis(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn acked_delivery_is_gone() {
        let queue = InMemoryJobQueue::new(Duration::from_millis(20));
        queue.enqueue(JobId::new()).await.unwrap();
        let delivery = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        queue.ack(&delivery).await.unwrap();
        assert!(queue.dequeue(Duration::from_millis(50)).await.unwrap().is_none());
    }
}

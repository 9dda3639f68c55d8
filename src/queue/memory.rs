//! In-process job queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::job::{DeadLetter, Delivery, Job, NackOutcome, QueueRetryPolicy};
use super::JobQueue;
use crate::error::Result;

/// Upper bound on one idle wait, so delayed jobs are never missed.
const IDLE_POLL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    delayed: Vec<(Instant, Delivery)>,
    in_flight: HashMap<String, Delivery>,
    dead: Vec<DeadLetter>,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, delivery) = self.delayed.remove(i);
                self.ready.push_back(delivery);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

/// At-least-once queue held in memory.
///
/// Deliveries stay in flight until acked or nacked; nacked deliveries are
/// redelivered per the [`QueueRetryPolicy`] and dead-lettered once it is
/// exhausted.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    policy: QueueRetryPolicy,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_policy(QueueRetryPolicy::default())
    }

    pub fn with_policy(policy: QueueRetryPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            policy,
        }
    }

    pub fn policy(&self) -> QueueRetryPolicy {
        self.policy
    }

    /// Ready plus delayed deliveries.
    pub fn pending(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.ready.len() + state.delayed.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .len()
    }

    fn take_ready(&self) -> std::result::Result<Delivery, Option<Instant>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.promote_due(Instant::now());
        match state.ready.pop_front() {
            Some(delivery) => {
                state.in_flight.insert(delivery.id.clone(), delivery.clone());
                Ok(delivery)
            }
            None => Err(state.next_due()),
        }
    }

    fn push_dead(&self, state: &mut QueueState, delivery: Delivery, error: &str) {
        warn!(
            execution_id = %delivery.job.execution_id,
            attempt = delivery.attempt,
            "Job dead-lettered: {}",
            error
        );
        state.dead.push(DeadLetter {
            delivery,
            error: error.to_string(),
            failed_at: Utc::now(),
        });
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<String> {
        let delivery = Delivery::new(job);
        let id = delivery.id.clone();
        debug!(execution_id = %delivery.job.execution_id, "Job enqueued");
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ready
            .push_back(delivery);
        self.notify.notify_one();
        Ok(id)
    }

    async fn receive(&self, cancel: &CancellationToken) -> Option<Delivery> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let wake_at = match self.take_ready() {
                Ok(delivery) => return Some(delivery),
                Err(next_due) => next_due.unwrap_or_else(|| Instant::now() + IDLE_POLL),
            };
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .remove(&delivery.id);
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, error: &str) -> Result<NackOutcome> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight.remove(&delivery.id);

        if self.policy.exhausted(delivery.attempt) {
            self.push_dead(&mut state, delivery, error);
            return Ok(NackOutcome::DeadLettered);
        }

        let delay = self.policy.delay_for(delivery.attempt);
        let mut next = delivery;
        next.attempt += 1;
        let attempt = next.attempt;
        debug!(execution_id = %next.job.execution_id, attempt, ?delay, "Job requeued");
        state.delayed.push((Instant::now() + delay, next));
        drop(state);
        self.notify.notify_one();
        Ok(NackOutcome::Requeued { attempt, delay })
    }

    async fn dead_letter(&self, delivery: Delivery, error: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight.remove(&delivery.id);
        self.push_dead(&mut state, delivery, error);
        Ok(())
    }

    async fn remove(&self, execution_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = state.ready.len() + state.delayed.len();
        state.ready.retain(|d| d.job.execution_id != execution_id);
        state.delayed.retain(|(_, d)| d.job.execution_id != execution_id);
        Ok(state.ready.len() + state.delayed.len() < before)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .dead
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ExecutionMode;
    use serde_json::json;

    fn job(id: &str) -> Job {
        Job {
            execution_id: id.to_string(),
            workflow_id: "wf".to_string(),
            mode: ExecutionMode::Manual,
            input_data: json!({}),
            trigger_node: None,
        }
    }

    #[tokio::test]
    async fn test_fifo_and_ack() {
        let queue = InMemoryQueue::new();
        queue.enqueue(job("a")).await.unwrap();
        queue.enqueue(job("b")).await.unwrap();

        let cancel = CancellationToken::new();
        let first = queue.receive(&cancel).await.unwrap();
        assert_eq!(first.job.execution_id, "a");
        assert_eq!(first.attempt, 1);
        assert_eq!(queue.in_flight(), 1);

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.receive(&cancel).await.unwrap().job.execution_id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_redelivers_then_dead_letters() {
        let queue = InMemoryQueue::with_policy(QueueRetryPolicy::new(2, Duration::from_secs(2)));
        let cancel = CancellationToken::new();
        queue.enqueue(job("a")).await.unwrap();

        let first = queue.receive(&cancel).await.unwrap();
        let outcome = queue.nack(first, "boom").await.unwrap();
        assert_eq!(
            outcome,
            NackOutcome::Requeued {
                attempt: 2,
                delay: Duration::from_secs(2)
            }
        );

        // Paused clock auto-advances to the redelivery time
        let second = queue.receive(&cancel).await.unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(queue.nack(second, "boom again").await.unwrap(), NackOutcome::DeadLettered);

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error, "boom again");
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_receive_stops_on_cancel() {
        let queue = InMemoryQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.receive(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_remove_pending_job() {
        let queue = InMemoryQueue::new();
        queue.enqueue(job("a")).await.unwrap();
        assert!(queue.remove("a").await.unwrap());
        assert!(!queue.remove("a").await.unwrap());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_receive_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(InMemoryQueue::new());
        let cancel = CancellationToken::new();
        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.receive(&cancel).await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(job("late")).await.unwrap();
        let delivery = waiter.await.unwrap().unwrap();
        assert_eq!(delivery.job.execution_id, "late");
    }
}

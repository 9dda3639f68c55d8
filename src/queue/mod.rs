//! Execution queue: trigger jobs, redelivery, and the workers that drain it.
//!
//! Delivery is at-least-once. A worker acks a job after the run reached a
//! terminal status and was persisted; a failed job is nacked and the
//! queue's [`QueueRetryPolicy`] decides between redelivery and the dead
//! letter list.

mod job;
mod memory;
mod worker;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use job::{DeadLetter, Delivery, Job, NackOutcome, QueueRetryPolicy};
pub use memory::InMemoryQueue;
pub use worker::{JobOutcome, Worker, WorkerPool};

use crate::error::Result;

/// Backend-neutral job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job; returns the delivery id.
    async fn enqueue(&self, job: Job) -> Result<String>;

    /// Wait for the next delivery. `None` once `cancel` fires.
    async fn receive(&self, cancel: &CancellationToken) -> Option<Delivery>;

    /// The delivery was handled; forget it.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// The delivery failed; redeliver or dead-letter it per the retry policy.
    async fn nack(&self, delivery: Delivery, error: &str) -> Result<NackOutcome>;

    /// Dead-letter immediately, skipping redelivery.
    async fn dead_letter(&self, delivery: Delivery, error: &str) -> Result<()>;

    /// Drop a job that has not been delivered yet. Returns false if no
    /// pending job matched.
    async fn remove(&self, execution_id: &str) -> Result<bool>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;
}

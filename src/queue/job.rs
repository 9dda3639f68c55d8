//! Job types carried by the execution queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::ExecutionMode;

/// Request to execute one persisted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub execution_id: String,
    pub workflow_id: String,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub input_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_node: Option<String>,
}

/// A job handed to a worker. `attempt` starts at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub job: Job,
    pub attempt: u32,
}

impl Delivery {
    pub fn new(job: Job) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job,
            attempt: 1,
        }
    }
}

/// Queue-level redelivery policy.
///
/// A failed delivery is retried after `base_delay * 2^(attempt - 1)`
/// until `max_attempts` deliveries have failed, then it is dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
}

impl Default for QueueRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl QueueRetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before redelivering after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// What `nack` did with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { attempt: u32, delay: Duration },
    DeadLettered,
}

/// A job that will not be delivered again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub delivery: Delivery,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

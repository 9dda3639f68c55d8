use std::time::Duration;

use crate::error::Error;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// `min(base * multiplier^attempt, max)`; the first retry is attempt 0.
    pub fn delay_for(&self, multiplier: f64, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.base_delay.as_millis() as f64 * multiplier.max(1.0).powi(exponent);
        let max = self.max_delay.as_millis() as f64;
        if !millis.is_finite() || millis >= max {
            return self.max_delay;
        }
        Duration::from_millis(millis.round() as u64)
    }

    /// Delay before retrying after `error`. An open circuit's retry hint
    /// raises the delay, never past `max_delay`.
    pub fn delay_after(&self, error: &Error, multiplier: f64, attempt: u32) -> Duration {
        let delay = self.delay_for(multiplier, attempt);
        match error {
            Error::CircuitOpen { retry_after_ms, .. } => delay
                .max(Duration::from_millis(*retry_after_ms))
                .min(self.max_delay),
            _ => delay,
        }
    }
}

/// Backoff with the default 1s base and 30s cap.
pub fn backoff_delay(multiplier: f64, attempt: u32) -> Duration {
    RetryPolicy::default().delay_for(multiplier, attempt)
}

//! Failure handling shared by node execution and the queue worker.
//!
//! - [`classifier`] maps errors to categories and retry policies
//! - [`tracker`] counts repeats by fingerprint
//! - [`retry`] computes backoff delays
//! - [`circuit_breaker`] isolates unhealthy services

pub mod circuit_breaker;
pub mod classifier;
pub mod retry;
pub mod tracker;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot,
    CircuitState, CircuitTransition, TransitionObserver,
};
pub use classifier::{
    classify_error, ErrorCategory, ErrorClassification, ErrorSeverity, RecoveryStrategy,
};
pub use retry::{backoff_delay, RetryPolicy};
pub use tracker::{should_retry, ErrorRecord, ErrorTracker};

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics;

/// Per-call retry settings.
#[derive(Debug, Clone, Default)]
pub struct RetryOptions<'a> {
    /// Route attempts through this service's circuit breaker.
    pub service: Option<String>,
    pub retry_enabled: bool,
    /// Caps total attempts, including the first.
    pub max_tries: Option<u32>,
    pub cancel: Option<&'a CancellationToken>,
    /// No retry is scheduled past this instant.
    pub deadline: Option<Instant>,
}

impl<'a> RetryOptions<'a> {
    pub fn new() -> Self {
        Self {
            retry_enabled: true,
            ..Default::default()
        }
    }

    pub fn service(mut self, service: Option<String>) -> Self {
        self.service = service;
        self
    }

    pub fn retry_enabled(mut self, enabled: bool) -> Self {
        self.retry_enabled = enabled;
        self
    }

    pub fn max_tries(mut self, max_tries: Option<u32>) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn cancel(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Attempts made, at least 1.
    pub attempts: u32,
    /// Tracker record of the last failure, if any attempt failed.
    pub last_record: Option<ErrorRecord>,
}

impl<T> RetryOutcome<T> {
    /// Retries performed after the first attempt.
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Breakers, error tracker, and backoff policy bundled for the engine.
#[derive(Clone, Default)]
pub struct Resilience {
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub tracker: Arc<ErrorTracker>,
    pub policy: RetryPolicy,
}

impl Resilience {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, policy: RetryPolicy) -> Self {
        Self {
            breakers,
            tracker: Arc::new(ErrorTracker::new()),
            policy,
        }
    }

    /// Run `op` with classification-driven retries.
    ///
    /// `op` receives the zero-based attempt number. Each failure is
    /// recorded in the tracker; a retry happens only while the record's
    /// budget, `max_tries`, and the deadline all allow it. Cancellation
    /// during backoff ends the loop with [`Error::Cancelled`].
    pub async fn run_with_retry<T, F, Fut>(
        &self,
        options: RetryOptions<'_>,
        mut op: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        let mut last_record = None;

        loop {
            let result = match &options.service {
                Some(service) => self.breakers.call(service, || op(attempt)).await,
                None => op(attempt).await,
            };

            let error = match result {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt + 1,
                        last_record,
                    }
                }
                Err(e) => e,
            };

            let record = self.tracker.record(&error);
            let within_tries = options.max_tries.map_or(true, |max| attempt + 1 < max);
            let retry = options.retry_enabled
                && within_tries
                && self.tracker.should_retry(&record, attempt);

            if !retry {
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt + 1,
                    last_record: Some(record),
                };
            }

            let delay = self.policy.delay_after(
                &error,
                record.classification.backoff_multiplier,
                attempt,
            );
            if let Some(deadline) = options.deadline {
                if Instant::now() + delay >= deadline {
                    debug!(attempt, "Retry would overrun deadline, giving up");
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt + 1,
                        last_record: Some(record),
                    };
                }
            }

            warn!(
                attempt = attempt + 1,
                category = %record.classification.category,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );
            metrics::record_retry(record.classification.category.as_str());
            last_record = Some(record);

            match options.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return RetryOutcome {
                                result: Err(Error::Cancelled("cancelled during retry backoff".to_string())),
                                attempts: attempt + 1,
                                last_record,
                            };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            attempt += 1;
        }
    }
}

//! Circuit breakers for external services.
//!
//! ## States
//!
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls fail with `CircuitOpen` without being attempted
//! - **HalfOpen**: exactly one probe call in flight at a time
//!
//! ## Configuration
//!
//! - `failure_threshold`: consecutive failures before opening (default: 5)
//! - `success_threshold`: probe successes needed to close (default: 2)
//! - `timeout`: how long to stay open before probing (default: 30s)

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use super::classifier::classify_error;
use crate::error::{Error, Result};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(30),
        }
    }
}

/// A state change, reported to the registry observer.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitTransition {
    pub service: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

pub type TransitionObserver = Arc<dyn Fn(&CircuitTransition) + Send + Sync>;

type ObserverSlot = Arc<RwLock<Option<TransitionObserver>>>;

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Probe,
}

pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    /// Millis since `epoch` when the circuit last opened
    opened_at: AtomicU64,
    probe_in_flight: AtomicBool,
    epoch: Instant,
    observer: ObserverSlot,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_config(service, CircuitBreakerConfig::default())
    }

    pub fn with_config(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_observer(service, config, Arc::new(RwLock::new(None)))
    }

    fn with_observer(service: impl Into<String>, config: CircuitBreakerConfig, observer: ObserverSlot) -> Self {
        Self {
            service: service.into(),
            config,
            state: AtomicU8::new(CLOSED),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            epoch: Instant::now(),
            observer,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn timeout_ms(&self) -> u64 {
        self.config.timeout.as_millis() as u64
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        if to == OPEN {
            // Published before the state so readers never pair OPEN with a stale timestamp
            self.opened_at.store(self.now_ms(), Ordering::SeqCst);
        }
        if self
            .state
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        match to {
            OPEN => self.success_count.store(0, Ordering::SeqCst),
            HALF_OPEN => {
                self.success_count.store(0, Ordering::SeqCst);
                self.probe_in_flight.store(false, Ordering::SeqCst);
            }
            _ => {
                self.failure_count.store(0, Ordering::SeqCst);
                self.success_count.store(0, Ordering::SeqCst);
            }
        }

        let transition = CircuitTransition {
            service: self.service.clone(),
            from: CircuitState::from_u8(from),
            to: CircuitState::from_u8(to),
        };
        match transition.to {
            CircuitState::Open => warn!(service = %self.service, from = %transition.from, "Circuit opened"),
            _ => info!(service = %self.service, from = %transition.from, to = %transition.to, "Circuit state changed"),
        }
        crate::metrics::record_circuit_state(&self.service, to);
        let observer = self
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(&transition);
        }
        true
    }

    /// Current state, moving OPEN to HALF_OPEN once the cool-down elapsed.
    pub fn state(&self) -> CircuitState {
        let raw = self.state.load(Ordering::SeqCst);
        if raw == OPEN {
            let elapsed = self.now_ms().saturating_sub(self.opened_at.load(Ordering::SeqCst));
            if elapsed >= self.timeout_ms() {
                self.transition(OPEN, HALF_OPEN);
            }
        }
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn retry_after_ms(&self) -> u64 {
        let elapsed = self.now_ms().saturating_sub(self.opened_at.load(Ordering::SeqCst));
        self.timeout_ms().saturating_sub(elapsed)
    }

    /// Ask to make a call. Fails with `CircuitOpen` when the circuit is
    /// open, or half-open with a probe already in flight.
    pub fn try_acquire(&self) -> Result<Admission> {
        match self.state() {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => Err(Error::CircuitOpen {
                service: self.service.clone(),
                retry_after_ms: self.retry_after_ms(),
            }),
            CircuitState::HalfOpen => {
                if self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    Ok(Admission::Probe)
                } else {
                    Err(Error::CircuitOpen {
                        service: self.service.clone(),
                        retry_after_ms: 0,
                    })
                }
            }
        }
    }

    pub fn record_success(&self, admission: Admission) {
        match admission {
            Admission::Probe => {
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    self.transition(HALF_OPEN, CLOSED);
                }
                self.probe_in_flight.store(false, Ordering::SeqCst);
            }
            Admission::Normal => {
                if self.state.load(Ordering::SeqCst) == CLOSED {
                    self.failure_count.store(0, Ordering::SeqCst);
                }
            }
        }
    }

    pub fn record_failure(&self, admission: Admission) {
        match admission {
            Admission::Probe => {
                self.transition(HALF_OPEN, OPEN);
                self.probe_in_flight.store(false, Ordering::SeqCst);
            }
            Admission::Normal => {
                if self.state.load(Ordering::SeqCst) != CLOSED {
                    return;
                }
                let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition(CLOSED, OPEN);
                }
            }
        }
    }

    /// Release a probe slot without a verdict (the call was abandoned).
    fn release(&self, admission: Admission) {
        if admission == Admission::Probe {
            self.probe_in_flight.store(false, Ordering::SeqCst);
        }
    }

    /// Force the breaker closed (operator action).
    pub fn reset(&self) {
        let from = self.state.load(Ordering::SeqCst);
        if from != CLOSED {
            self.transition(from, CLOSED);
        }
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        self.probe_in_flight.store(false, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state();
        CircuitSnapshot {
            service: self.service.clone(),
            state,
            failure_count: self.failure_count.load(Ordering::SeqCst),
            success_count: self.success_count.load(Ordering::SeqCst),
            retry_after_ms: (state == CircuitState::Open).then(|| self.retry_after_ms()),
        }
    }

    /// Run `f` through the breaker.
    ///
    /// Only failures that indicate the service itself is unhealthy count
    /// against the circuit; a validation or auth error proves the service
    /// answered.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.try_acquire()?;
        let mut guard = AdmissionGuard {
            breaker: self,
            admission,
            settled: false,
        };
        let result = f().await;
        guard.settled = true;
        match &result {
            Ok(_) => self.record_success(admission),
            Err(e) if trips_breaker(e) => self.record_failure(admission),
            Err(_) => self.record_success(admission),
        }
        result
    }
}

/// Frees a half-open probe slot if the call future is dropped mid-flight.
struct AdmissionGuard<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.admission);
        }
    }
}

fn trips_breaker(error: &Error) -> bool {
    use super::classifier::ErrorCategory::*;
    matches!(
        classify_error(error).category,
        Network | Timeout | ExternalService | Database | ResourceExhaustion
    ) && !matches!(error, Error::CircuitOpen { .. })
}

/// Process-wide breakers keyed by service name.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
    observer: ObserverSlot,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }

    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config: config,
            observer: Arc::new(RwLock::new(None)),
        }
    }

    /// Install a callback invoked on every state change of every breaker.
    pub fn set_observer(&self, observer: TransitionObserver) {
        *self.observer.write().unwrap_or_else(PoisonError::into_inner) = Some(observer);
    }

    pub fn get_or_create(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
        {
            return breaker.clone();
        }
        self.breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(service.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_observer(
                    service,
                    self.default_config.clone(),
                    self.observer.clone(),
                ))
            })
            .clone()
    }

    pub async fn call<T, F, Fut>(&self, service: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.get_or_create(service);
        breaker.call(f).await
    }

    /// State of a service's breaker; services never called are closed.
    pub fn state(&self, service: &str) -> CircuitState {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn states(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<CircuitSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }

    /// Close a service's breaker. Returns false for unknown services.
    pub fn reset(&self, service: &str) -> bool {
        let breaker = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned();
        match breaker {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
        {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

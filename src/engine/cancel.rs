//! Cancellation registry for in-flight runs.
//!
//! The worker registers each run it picks up; `Engine::cancel` looks the
//! run up here and trips its token. The scheduler checks the token between
//! dispatches, and every node call receives it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an execution and return its cancellation token.
    ///
    /// Registering the same id twice returns the existing token, so a
    /// cancellation issued before a redelivery still applies.
    pub fn register(&self, execution_id: &str) -> CancellationToken {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(execution_id.to_string())
            .or_default()
            .clone()
    }

    /// Cancel a registered execution. Returns false if it is not running.
    pub fn cancel(&self, execution_id: &str) -> bool {
        match self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
        {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, execution_id: &str) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(execution_id)
    }

    /// Unregister an execution (called when execution completes).
    pub fn unregister(&self, execution_id: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution_id);
    }

    /// Cancel everything, e.g. on forced shutdown.
    pub fn cancel_all(&self) {
        for token in self.tokens.lock().unwrap_or_else(PoisonError::into_inner).values() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_registered_run() {
        let registry = CancellationRegistry::new();
        let token = registry.register("exec-1");
        assert!(!token.is_cancelled());

        assert!(registry.cancel("exec-1"));
        assert!(token.is_cancelled());
        assert!(registry.register("exec-1").is_cancelled());

        registry.unregister("exec-1");
        assert!(!registry.cancel("exec-1"));
        assert!(!registry.is_registered("exec-1"));
    }

    #[test]
    fn test_cancel_all() {
        let registry = CancellationRegistry::new();
        let a = registry.register("a");
        let b = registry.register("b");
        registry.cancel_all();
        assert!(a.is_cancelled() && b.is_cancelled());
    }
}

//! Live execution events.
//!
//! Subscribers get a `tokio::sync::broadcast` receiver. Slow subscribers
//! lag and lose events; the engine never blocks on them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::resilience::CircuitTransition;
use crate::storage::{ExecutionStatus, NodeStatus};

/// Maximum number of events to buffer in broadcast channel.
const BROADCAST_CAPACITY: usize = 1024;

/// Event types for execution monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    ExecutionStarted {
        execution_id: String,
        workflow_id: String,
        mode: String,
    },
    /// A node moved to a new status
    NodeStatus {
        execution_id: String,
        node_id: String,
        node_type: String,
        status: NodeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ExecutionCompleted {
        execution_id: String,
        workflow_id: String,
        status: ExecutionStatus,
        duration_ms: u64,
    },
    ExecutionFailed {
        execution_id: String,
        workflow_id: String,
        error: String,
    },
    CircuitChanged {
        service: String,
        from: String,
        to: String,
    },
}

/// Broadcast hub for [`MonitorEvent`]s.
#[derive(Debug, Clone)]
pub struct Monitor {
    tx: broadcast::Sender<MonitorEvent>,
}

impl Monitor {
    /// Create a new monitor.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all subscribers.
    pub fn broadcast(&self, event: MonitorEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.tx.send(event);
    }

    pub fn execution_started(&self, execution_id: &str, workflow_id: &str, mode: &str) {
        self.broadcast(MonitorEvent::ExecutionStarted {
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            mode: mode.to_string(),
        });
    }

    pub fn node_status(
        &self,
        execution_id: &str,
        node_id: &str,
        node_type: &str,
        status: NodeStatus,
        error: Option<&str>,
    ) {
        self.broadcast(MonitorEvent::NodeStatus {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            status,
            error: error.map(str::to_string),
        });
    }

    pub fn execution_completed(
        &self,
        execution_id: &str,
        workflow_id: &str,
        status: ExecutionStatus,
        duration_ms: u64,
    ) {
        self.broadcast(MonitorEvent::ExecutionCompleted {
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            status,
            duration_ms,
        });
    }

    pub fn execution_failed(&self, execution_id: &str, workflow_id: &str, error: &str) {
        self.broadcast(MonitorEvent::ExecutionFailed {
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            error: error.to_string(),
        });
    }

    pub fn circuit_changed(&self, transition: &CircuitTransition) {
        self.broadcast(MonitorEvent::CircuitChanged {
            service: transition.service.clone(),
            from: transition.from.to_string(),
            to: transition.to.to_string(),
        });
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let monitor = Monitor::new();
        let mut rx = monitor.subscribe();

        monitor.execution_started("exec-1", "wf", "manual");
        monitor.circuit_changed(&CircuitTransition {
            service: "http:api.example.com".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
        });

        assert!(matches!(rx.recv().await.unwrap(), MonitorEvent::ExecutionStarted { .. }));
        match rx.recv().await.unwrap() {
            MonitorEvent::CircuitChanged { to, .. } => assert_eq!(to, "open"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        Monitor::new().execution_failed("exec-1", "wf", "boom");
    }

    #[test]
    fn test_event_json_shape() {
        let event = MonitorEvent::NodeStatus {
            execution_id: "e".into(),
            node_id: "n".into(),
            node_type: "set".into(),
            status: NodeStatus::Skipped,
            error: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "node_status");
        assert_eq!(json["status"], "skipped");
        assert!(json.get("error").is_none());
    }
}

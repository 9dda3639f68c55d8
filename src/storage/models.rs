//! Storage models.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::WorkflowDefinition;

/// What started a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Manual,
    Webhook,
    Schedule,
    Retry,
    /// Run of an error workflow, started by a failed run
    Error,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Webhook => "webhook",
            Self::Schedule => "schedule",
            Self::Retry => "retry",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "webhook" => Ok(Self::Webhook),
            "schedule" => Ok(Self::Schedule),
            "retry" => Ok(Self::Retry),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown execution mode: {}", s)),
        }
    }
}

/// Execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// Per-node status within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Waiting,
    Queued,
    Running,
    Success,
    Error,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Skipped)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Unknown node status: {}", s)),
        }
    }
}

/// Structured failure detail for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeErrorDetail {
    pub message: String,
    pub category: String,
    pub severity: String,
    pub retry_count: u32,
}

impl NodeErrorDetail {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Node execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub node_id: String,
    pub node_name: String,
    pub node_type: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub input: Vec<Value>,
    /// Items per output port
    #[serde(default)]
    pub output: BTreeMap<String, Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeErrorDetail>,
    #[serde(default)]
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeExecutionRecord {
    pub fn new(node_id: &str, node_name: &str, node_type: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_name: node_name.to_string(),
            node_type: node_type.to_string(),
            status: NodeStatus::Waiting,
            input: Vec::new(),
            output: BTreeMap::new(),
            error: None,
            retry_count: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let (start, end) = (self.started_at?, self.finished_at?);
        Some((end - start).num_milliseconds().max(0) as u64)
    }

    pub fn output_count(&self) -> usize {
        self.output.values().map(Vec::len).sum()
    }
}

/// One run of a workflow.
///
/// `workflow` is the definition as it was at trigger time; edits made
/// after that never reach an in-flight run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub mode: ExecutionMode,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub workflow: WorkflowDefinition,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeExecutionRecord>,
}

impl ExecutionRun {
    /// Create a running execution over a snapshot of `workflow`.
    pub fn new(workflow: &WorkflowDefinition, mode: ExecutionMode, input: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            mode,
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            workflow: workflow.clone(),
            input,
            trigger_node: None,
            error: None,
            nodes: Vec::new(),
        }
    }

    pub fn with_trigger_node(mut self, trigger_node: Option<String>) -> Self {
        self.trigger_node = trigger_node;
        self
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeExecutionRecord> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Move to a terminal status.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<String>) {
        self.status = status;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    pub fn summary(&self) -> ExecutionSummary {
        let count = |status: NodeStatus| self.nodes.iter().filter(|n| n.status == status).count() as u32;
        ExecutionSummary {
            nodes_executed: self
                .nodes
                .iter()
                .filter(|n| matches!(n.status, NodeStatus::Success | NodeStatus::Error))
                .count() as u32,
            nodes_succeeded: count(NodeStatus::Success),
            nodes_failed: count(NodeStatus::Error),
            nodes_skipped: count(NodeStatus::Skipped),
            items_processed: self.nodes.iter().map(|n| n.input.len() as u32).sum(),
            duration_ms: self.duration_ms(),
        }
    }
}

/// Execution summary for CLI and event output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub nodes_executed: u32,
    pub nodes_succeeded: u32,
    pub nodes_failed: u32,
    pub nodes_skipped: u32,
    pub items_processed: u32,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ExecutionStatus::Running,
            ExecutionStatus::Success,
            ExecutionStatus::Error,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>().unwrap(), status);
        }
        assert!("completed".parse::<ExecutionStatus>().is_err());
        assert_eq!("error".parse::<ExecutionMode>().unwrap(), ExecutionMode::Error);
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::Queued.is_terminal());
    }

    #[test]
    fn test_summary_counts() {
        let wf = WorkflowDefinition::new("wf", "wf");
        let mut run = ExecutionRun::new(&wf, ExecutionMode::Manual, json!({}));
        let mut ok = NodeExecutionRecord::new("a", "a", "set");
        ok.status = NodeStatus::Success;
        ok.input = vec![json!(1), json!(2)];
        let mut failed = NodeExecutionRecord::new("b", "b", "http");
        failed.status = NodeStatus::Error;
        failed.input = vec![json!(3)];
        let mut skipped = NodeExecutionRecord::new("c", "c", "set");
        skipped.status = NodeStatus::Skipped;
        run.nodes = vec![ok, failed, skipped];
        run.finish(ExecutionStatus::Error, Some("boom".into()));

        let summary = run.summary();
        assert_eq!(summary.nodes_executed, 2);
        assert_eq!(summary.nodes_succeeded, 1);
        assert_eq!(summary.nodes_failed, 1);
        assert_eq!(summary.nodes_skipped, 1);
        assert_eq!(summary.items_processed, 3);
        assert!(run.status.is_terminal());
    }
}

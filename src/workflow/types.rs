//! Workflow type definitions.
//!
//! A workflow is a graph of typed nodes joined by named-port connections.
//! Definitions are plain data; the engine snapshots one at trigger time.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::nodes::MAIN_PORT;

/// A complete workflow definition.
///
/// # Example YAML
///
/// ```yaml
/// id: order-sync
/// name: Order sync
///
/// nodes:
///   - id: hook
///     type: webhook
///   - id: shape
///     type: set
///     parameters:
///       values:
///         order_id: "{{ $json.id }}"
///
/// connections:
///   - source: hook
///     target: shape
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique identifier; defaults to `name` when omitted
    #[serde(default)]
    pub id: String,

    /// Human-readable name
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Nodes in declaration order
    pub nodes: Vec<WorkflowNode>,

    /// Directed edges between node ports
    #[serde(default)]
    pub connections: Vec<NodeConnection>,

    #[serde(default)]
    pub settings: WorkflowSettings,

    /// Inactive workflows only accept manual runs
    #[serde(default = "default_true")]
    pub active: bool,

    /// Constants exposed to expressions as `$vars`
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// A node inside a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique node identifier
    pub id: String,

    /// Display name, used by `$node["name"]`; defaults to `id`
    #[serde(default)]
    pub name: String,

    /// Registry key (e.g., "http", "set", "webhook")
    #[serde(rename = "type")]
    pub node_type: String,

    /// Raw parameters; may contain `{{ }}` expressions
    #[serde(default = "empty_object", alias = "config")]
    pub parameters: Value,

    /// Disabled nodes pass their input through and are recorded as skipped
    #[serde(default)]
    pub disabled: bool,

    /// Annotate failing items with an error and keep going
    #[serde(default)]
    pub continue_on_fail: bool,

    /// Run once with the whole batch instead of once per item
    #[serde(default)]
    pub execute_once: bool,

    /// Allow classifier-driven retries of this node's calls
    #[serde(default = "default_true")]
    pub retry_on_fail: bool,

    /// Upper bound on attempts, including the first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tries: Option<u32>,

    /// Per-node timeout; falls back to `settings.node_timeout_seconds`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Credential id resolved through the credential provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

impl WorkflowNode {
    /// Create a node with default flags.
    pub fn new(id: &str, node_type: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            node_type: node_type.to_string(),
            parameters: empty_object(),
            disabled: false,
            continue_on_fail: false,
            execute_once: false,
            retry_on_fail: true,
            max_tries: None,
            timeout_seconds: None,
            credentials: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_continue_on_fail(mut self, continue_on_fail: bool) -> Self {
        self.continue_on_fail = continue_on_fail;
        self
    }

    /// Name used for `$node` lookups.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// A directed edge from one node's output port to another's input port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConnection {
    #[serde(alias = "from")]
    pub source: String,

    #[serde(default = "default_port", alias = "output")]
    pub source_output: String,

    #[serde(alias = "to")]
    pub target: String,

    #[serde(default = "default_port", alias = "input")]
    pub target_input: String,
}

impl NodeConnection {
    /// Connect `main` to `main`.
    pub fn new(source: &str, target: &str) -> Self {
        Self::ports(source, MAIN_PORT, target, MAIN_PORT)
    }

    pub fn ports(source: &str, source_output: &str, target: &str, target_input: &str) -> Self {
        Self {
            source: source.to_string(),
            source_output: source_output.to_string(),
            target: target.to_string(),
            target_input: target_input.to_string(),
        }
    }
}

/// Which node records a finished run keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavePolicy {
    /// Keep node records for every run
    #[default]
    All,
    /// Keep node records only when the run fails
    ErrorsOnly,
    /// Never keep node records
    None,
}

impl SavePolicy {
    /// Whether node records survive a run that ended with `failed`.
    pub fn keeps_nodes(&self, failed: bool) -> bool {
        match self {
            SavePolicy::All => true,
            SavePolicy::ErrorsOnly => failed,
            SavePolicy::None => false,
        }
    }
}

/// Global workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Maximum run time in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Default per-node timeout in seconds
    #[serde(default = "default_node_timeout")]
    pub node_timeout_seconds: u64,

    /// Workflow id to trigger when a run of this workflow fails.
    /// The error workflow receives the failure context as input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_workflow: Option<String>,

    #[serde(default)]
    pub save_policy: SavePolicy,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            node_timeout_seconds: default_node_timeout(),
            error_workflow: None,
            save_policy: SavePolicy::default(),
        }
    }
}

fn default_timeout() -> u64 {
    3600 // 1 hour
}

fn default_node_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_port() -> String {
    MAIN_PORT.to_string()
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl WorkflowDefinition {
    /// Create an empty, active workflow.
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            nodes: Vec::new(),
            connections: Vec::new(),
            settings: WorkflowSettings::default(),
            active: true,
            variables: Map::new(),
        }
    }

    pub fn with_node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_connection(mut self, connection: NodeConnection) -> Self {
        self.connections.push(connection);
        self
    }

    /// Fill derived defaults: id from name, node names from ids.
    pub fn normalize(&mut self) {
        if self.id.is_empty() {
            self.id = self.name.clone();
        }
        for node in &mut self.nodes {
            if node.name.is_empty() {
                node.name = node.id.clone();
            }
        }
    }

    /// Get a node by ID.
    pub fn get_node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Connections leaving `node_id`, in declaration order.
    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a NodeConnection> + 'a {
        self.connections.iter().filter(move |c| c.source == node_id)
    }

    /// Connections entering `node_id`, in declaration order.
    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a NodeConnection> + 'a {
        self.connections.iter().filter(move |c| c.target == node_id)
    }

    /// Get all node types used in this workflow.
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.nodes.iter().map(|n| n.node_type.as_str()).collect();
        types.sort();
        types.dedup();
        types
    }
}

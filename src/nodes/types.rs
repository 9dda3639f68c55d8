//! Node trait and context types.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::credentials::CredentialData;
use crate::error::{Error, Result};
use crate::storage::ExecutionMode;

/// Default port name for single-input / single-output nodes.
pub const MAIN_PORT: &str = "main";

/// Result of node execution: items per output port.
///
/// Ports are independent; a port that is absent or empty does not
/// continue its branch.
#[derive(Debug, Clone, Default)]
pub struct NodeResult {
    pub outputs: BTreeMap<String, Vec<Value>>,
    /// Metadata (timing, debug info, etc.)
    pub metadata: Value,
}

impl NodeResult {
    /// Items on the `main` port.
    pub fn main(items: Vec<Value>) -> Self {
        Self::port(MAIN_PORT, items)
    }

    /// Items on a named port.
    pub fn port(name: &str, items: Vec<Value>) -> Self {
        Self::empty().with_port(name, items)
    }

    pub fn with_port(mut self, name: &str, items: Vec<Value>) -> Self {
        self.outputs.entry(name.to_string()).or_default().extend(items);
        self
    }

    /// No output on any port.
    pub fn empty() -> Self {
        Self {
            outputs: BTreeMap::new(),
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn items(&self, port: &str) -> &[Value] {
        self.outputs.get(port).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn item_count(&self) -> usize {
        self.outputs.values().map(Vec::len).sum()
    }

    /// Append another result's port items, keeping port order.
    pub fn merge(&mut self, other: NodeResult) {
        for (port, items) in other.outputs {
            self.outputs.entry(port).or_default().extend(items);
        }
    }
}

/// Declared parameter of a node type.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub kind: &'static str,
    pub required: bool,
    pub description: &'static str,
}

impl ParameterSpec {
    pub const fn required(name: &'static str, kind: &'static str, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
        }
    }

    pub const fn optional(name: &'static str, kind: &'static str, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
        }
    }
}

/// Static description of a node type.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct NodeMetadata {
    pub inputs: &'static [&'static str],
    pub outputs: &'static [&'static str],
    /// Can start a run.
    pub trigger: bool,
    /// Runs once with the whole input batch instead of once per item.
    pub execute_once: bool,
    pub parameters: &'static [ParameterSpec],
}

impl NodeMetadata {
    pub const fn transform() -> Self {
        Self {
            inputs: &[MAIN_PORT],
            outputs: &[MAIN_PORT],
            trigger: false,
            execute_once: false,
            parameters: &[],
        }
    }

    pub const fn trigger() -> Self {
        Self {
            inputs: &[],
            outputs: &[MAIN_PORT],
            trigger: true,
            execute_once: true,
            parameters: &[],
        }
    }

    pub const fn with_parameters(mut self, parameters: &'static [ParameterSpec]) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn has_input(&self, port: &str) -> bool {
        self.inputs.contains(&port)
    }

    pub fn has_output(&self, port: &str) -> bool {
        self.outputs.contains(&port)
    }
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self::transform()
    }
}

/// Context passed to a node during execution.
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// Items this call processes: one item per call, or the whole batch
    /// for execute-once nodes.
    pub items: Vec<Value>,

    /// Items delivered to each input port, in connection order.
    pub inputs: BTreeMap<String, Vec<Value>>,

    /// Current item index (per-item execution only)
    pub item_index: Option<usize>,

    pub execution_id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub node_id: String,
    pub node_name: String,
    pub mode: ExecutionMode,

    /// Decrypted credential fields, if the node references a credential
    pub credentials: Option<Arc<CredentialData>>,

    /// Cooperative cancellation; long-running nodes must poll it
    pub cancel: CancellationToken,

    pub continue_on_fail: bool,

    /// Zero-based attempt number within node-level retry
    pub attempt: u32,
}

impl NodeContext {
    /// Create a new context.
    pub fn new(execution_id: &str, workflow_name: &str) -> Self {
        Self {
            items: Vec::new(),
            inputs: BTreeMap::new(),
            item_index: None,
            execution_id: execution_id.to_string(),
            workflow_id: String::new(),
            workflow_name: workflow_name.to_string(),
            node_id: String::new(),
            node_name: String::new(),
            mode: ExecutionMode::Manual,
            credentials: None,
            cancel: CancellationToken::new(),
            continue_on_fail: false,
            attempt: 0,
        }
    }

    /// Set the processed items and the `main` input port.
    pub fn with_items(mut self, items: Vec<Value>) -> Self {
        self.inputs.insert(MAIN_PORT.to_string(), items.clone());
        self.items = items;
        self
    }

    pub fn with_input(mut self, port: &str, items: Vec<Value>) -> Self {
        self.inputs.insert(port.to_string(), items);
        self
    }

    pub fn with_node(mut self, node_id: &str, node_name: &str) -> Self {
        self.node_id = node_id.to_string();
        self.node_name = node_name.to_string();
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialData) -> Self {
        self.credentials = Some(Arc::new(credentials));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The item being processed, or null when there is none.
    pub fn item(&self) -> &Value {
        static NULL: Value = Value::Null;
        self.items.first().unwrap_or(&NULL)
    }

    pub fn input(&self, port: &str) -> &[Value] {
        self.inputs.get(port).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Credential field, if present.
    pub fn credential(&self, field: &str) -> Option<&str> {
        self.credentials.as_deref().and_then(|c| c.get(field))
    }

    pub fn require_credential(&self, field: &str) -> Result<&str> {
        self.credential(field).ok_or_else(|| {
            Error::Credential(format!(
                "node '{}' requires credential field '{}'",
                self.node_id, field
            ))
        })
    }

    /// Fail fast if the run was cancelled.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("node '{}' cancelled", self.node_id)));
        }
        Ok(())
    }
}

/// Trait that all node types must implement.
#[async_trait]
pub trait Node: Send + Sync {
    /// Get the node type name (e.g., "http", "set", "webhook").
    fn node_type(&self) -> &str;

    /// Get a description of this node type.
    fn description(&self) -> &str {
        "A workflow node"
    }

    /// Ports, trigger flag, and parameter schema.
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }

    /// External service this call depends on, for circuit breaking.
    /// `None` means the node makes no external call.
    fn service_key(&self, _params: &Value) -> Option<String> {
        None
    }

    /// Execute the node with resolved parameters.
    ///
    /// # Arguments
    /// * `params` - Node parameters with every expression already resolved
    /// * `ctx` - Items, credentials, and run metadata
    async fn execute(&self, params: &Value, ctx: &NodeContext) -> Result<NodeResult>;
}

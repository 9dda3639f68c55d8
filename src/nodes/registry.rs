//! Node registry - maps type names to node implementations.

use std::collections::HashMap;
use std::sync::Arc;

use super::types::{Node, NodeMetadata};
use super::{
    DatabaseNode, EmailNode, HttpNode, IfNode, ManualTriggerNode, MergeNode, S3Node,
    ScheduleTriggerNode, SetNode, WebhookTriggerNode,
};
use crate::error::{Error, Result};

/// Registry of available node types. Populated once at startup, then
/// shared read-only.
#[derive(Clone)]
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<dyn Node>>,
}

impl NodeRegistry {
    /// Create a new registry with the built-in nodes.
    pub fn new() -> Self {
        let mut registry = Self::empty();

        registry.register(Arc::new(WebhookTriggerNode));
        registry.register(Arc::new(ManualTriggerNode));
        registry.register(Arc::new(ScheduleTriggerNode));
        registry.register(Arc::new(SetNode::new()));
        registry.register(Arc::new(IfNode::new()));
        registry.register(Arc::new(MergeNode::new()));
        registry.register(Arc::new(HttpNode::new()));
        registry.register(Arc::new(EmailNode::new()));
        registry.register(Arc::new(S3Node::new()));
        registry.register(Arc::new(DatabaseNode::new()));

        registry
    }

    /// Create an empty registry (for testing).
    pub fn empty() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Register a node type, replacing any previous one with that name.
    pub fn register(&mut self, node: Arc<dyn Node>) {
        self.nodes.insert(node.node_type().to_string(), node);
    }

    /// Get a node by type name.
    pub fn get(&self, node_type: &str) -> Option<Arc<dyn Node>> {
        self.nodes.get(node_type).cloned()
    }

    /// Like [`get`](Self::get), but unknown types are an error.
    pub fn require(&self, node_type: &str) -> Result<Arc<dyn Node>> {
        self.get(node_type)
            .ok_or_else(|| Error::Validation(format!("Unknown node type: {}", node_type)))
    }

    /// Check if a node type is registered.
    pub fn has(&self, node_type: &str) -> bool {
        self.nodes.contains_key(node_type)
    }

    pub fn metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.nodes.get(node_type).map(|n| n.metadata())
    }

    /// List all registered node types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.nodes.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Get descriptions of all registered nodes, sorted by type.
    pub fn descriptions(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .nodes
            .iter()
            .map(|(name, node)| (name.as_str(), node.description()))
            .collect();
        out.sort_unstable_by_key(|(name, _)| *name);
        out
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{NodeContext, NodeResult};
    use async_trait::async_trait;
    use serde_json::Value;

    struct EchoNode;

    #[async_trait]
    impl Node for EchoNode {
        fn node_type(&self) -> &str {
            "echo"
        }

        async fn execute(&self, _params: &Value, ctx: &NodeContext) -> Result<NodeResult> {
            Ok(NodeResult::main(ctx.items.clone()))
        }
    }

    #[test]
    fn test_registry_default_nodes() {
        let registry = NodeRegistry::new();

        assert_eq!(
            registry.list(),
            vec!["database", "email", "http", "if", "manual", "merge", "s3", "schedule", "set", "webhook"]
        );
        assert!(!registry.has("nonexistent"));
        assert!(registry.require("nonexistent").is_err());
    }

    #[test]
    fn test_registry_metadata() {
        let registry = NodeRegistry::new();
        assert!(registry.metadata("webhook").unwrap().trigger);
        assert!(!registry.metadata("http").unwrap().trigger);
        assert_eq!(registry.metadata("if").unwrap().outputs, &["true", "false"]);
        assert!(registry.metadata("merge").unwrap().execute_once);
    }

    #[test]
    fn test_register_custom_node() {
        let mut registry = NodeRegistry::empty();
        registry.register(Arc::new(EchoNode));
        assert_eq!(registry.list(), vec!["echo"]);
        assert_eq!(registry.descriptions(), vec![("echo", "A workflow node")]);
    }
}

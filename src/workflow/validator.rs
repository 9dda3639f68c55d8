//! Workflow validation.
//!
//! Validation collects every problem instead of stopping at the first, so a
//! caller can report the whole list at once.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::types::WorkflowDefinition;
use crate::expression::validate_expression;
use crate::nodes::NodeRegistry;

/// Category of a validation problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    EmptyWorkflow,
    InvalidNodeId,
    DuplicateNodeId,
    UnknownNodeType,
    InvalidConnection,
    InvalidPort,
    MissingTrigger,
    CycleDetected,
    InvalidExpression,
}

/// One validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub message: String,
}

impl ValidationError {
    fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            node_id: None,
            message: message.into(),
        }
    }

    fn at(kind: ValidationErrorKind, node_id: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            node_id: Some(node_id.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(id) => write!(f, "node '{}': {}", id, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Validate a workflow definition against the node registry.
///
/// Checks for:
/// - At least one node, with unique non-empty IDs
/// - Known node types
/// - Connections between existing nodes and declared ports
/// - At least one trigger node
/// - No cycles
/// - Syntactically valid expressions in every parameter
pub fn validate_workflow(
    workflow: &WorkflowDefinition,
    registry: &NodeRegistry,
) -> std::result::Result<(), Vec<ValidationError>> {
    use ValidationErrorKind as Kind;

    let mut errors = Vec::new();

    if workflow.nodes.is_empty() {
        errors.push(ValidationError::new(
            Kind::EmptyWorkflow,
            "workflow must have at least one node",
        ));
    }

    let mut ids = HashSet::new();
    for node in &workflow.nodes {
        if node.id.trim().is_empty() {
            errors.push(ValidationError::new(Kind::InvalidNodeId, "node id cannot be empty"));
        } else if !ids.insert(node.id.as_str()) {
            errors.push(ValidationError::at(
                Kind::DuplicateNodeId,
                &node.id,
                format!("duplicate node id '{}'", node.id),
            ));
        }

        if !registry.has(&node.node_type) {
            errors.push(ValidationError::at(
                Kind::UnknownNodeType,
                &node.id,
                format!("unknown node type '{}'", node.node_type),
            ));
        }

        check_expressions(&node.parameters, &node.id, &mut errors);
    }

    let node_types: HashMap<&str, &str> = workflow
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n.node_type.as_str()))
        .collect();

    for conn in &workflow.connections {
        let source = node_types.get(conn.source.as_str());
        let target = node_types.get(conn.target.as_str());
        if source.is_none() || target.is_none() {
            let missing = if source.is_none() { &conn.source } else { &conn.target };
            errors.push(ValidationError::new(
                Kind::InvalidConnection,
                format!(
                    "invalid connection {} -> {}: node '{}' does not exist",
                    conn.source, conn.target, missing
                ),
            ));
            continue;
        }

        if let Some(meta) = source.and_then(|t| registry.metadata(t)) {
            if !meta.has_output(&conn.source_output) {
                errors.push(ValidationError::at(
                    Kind::InvalidPort,
                    &conn.source,
                    format!("invalid connection: no output port '{}'", conn.source_output),
                ));
            }
        }
        if let Some(meta) = target.and_then(|t| registry.metadata(t)) {
            if !meta.has_input(&conn.target_input) {
                errors.push(ValidationError::at(
                    Kind::InvalidPort,
                    &conn.target,
                    format!("invalid connection: no input port '{}'", conn.target_input),
                ));
            }
        }
    }

    let has_trigger = workflow
        .nodes
        .iter()
        .any(|n| registry.metadata(&n.node_type).is_some_and(|m| m.trigger));
    if !workflow.nodes.is_empty() && !has_trigger {
        errors.push(ValidationError::new(
            Kind::MissingTrigger,
            "missing trigger node: workflow needs at least one trigger",
        ));
    }

    if let Some(node_id) = find_cycle(workflow) {
        errors.push(ValidationError::at(
            Kind::CycleDetected,
            node_id,
            format!("cycle detected involving node '{}'", node_id),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_expressions(value: &Value, node_id: &str, errors: &mut Vec<ValidationError>) {
    match value {
        Value::String(text) => {
            if let Err(e) = validate_expression(text) {
                errors.push(ValidationError::at(
                    ValidationErrorKind::InvalidExpression,
                    node_id,
                    format!("invalid expression '{}': {}", text, e),
                ));
            }
        }
        Value::Array(items) => items.iter().for_each(|v| check_expressions(v, node_id, errors)),
        Value::Object(map) => map.values().for_each(|v| check_expressions(v, node_id, errors)),
        _ => {}
    }
}

/// Return a node on a cycle, if any. Dangling connections are ignored.
fn find_cycle(workflow: &WorkflowDefinition) -> Option<&str> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for conn in &workflow.connections {
        adjacency
            .entry(conn.source.as_str())
            .or_default()
            .push(conn.target.as_str());
    }

    fn visit<'a>(
        node: &'a str,
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Option<&'a str> {
        match marks.get(node) {
            Some(Mark::Visiting) => return Some(node),
            Some(Mark::Done) => return None,
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        for &next in adjacency.get(node).into_iter().flatten() {
            if let Some(found) = visit(next, adjacency, marks) {
                return Some(found);
            }
        }
        marks.insert(node, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    workflow
        .nodes
        .iter()
        .find_map(|n| visit(n.id.as_str(), &adjacency, &mut marks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{NodeConnection, WorkflowNode};
    use serde_json::json;

    fn kinds(workflow: &WorkflowDefinition) -> Vec<ValidationErrorKind> {
        match validate_workflow(workflow, &NodeRegistry::new()) {
            Ok(()) => Vec::new(),
            Err(errors) => errors.into_iter().map(|e| e.kind).collect(),
        }
    }

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "wf")
            .with_node(WorkflowNode::new("hook", "webhook"))
            .with_node(WorkflowNode::new("shape", "set"))
            .with_connection(NodeConnection::new("hook", "shape"))
    }

    #[test]
    fn test_valid_workflow() {
        assert!(validate_workflow(&linear(), &NodeRegistry::new()).is_ok());
    }

    #[test]
    fn test_missing_trigger() {
        let wf = WorkflowDefinition::new("wf", "wf").with_node(WorkflowNode::new("shape", "set"));
        let errors = validate_workflow(&wf, &NodeRegistry::new()).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("missing trigger node"));
    }

    #[test]
    fn test_invalid_connection() {
        let wf = linear().with_connection(NodeConnection::new("shape", "ghost"));
        let errors = validate_workflow(&wf, &NodeRegistry::new()).unwrap_err();
        assert_eq!(errors[0].kind, ValidationErrorKind::InvalidConnection);
        assert!(errors[0].to_string().contains("invalid connection"));
    }

    #[test]
    fn test_collects_every_problem() {
        let wf = WorkflowDefinition::new("wf", "wf")
            .with_node(WorkflowNode::new("a", "set"))
            .with_node(WorkflowNode::new("a", "teleport"))
            .with_node(WorkflowNode::new("", "set"));
        assert_eq!(
            kinds(&wf),
            vec![
                ValidationErrorKind::DuplicateNodeId,
                ValidationErrorKind::UnknownNodeType,
                ValidationErrorKind::InvalidNodeId,
                ValidationErrorKind::MissingTrigger,
            ]
        );
        assert_eq!(kinds(&WorkflowDefinition::new("e", "e")), vec![ValidationErrorKind::EmptyWorkflow]);
    }

    #[test]
    fn test_undeclared_ports() {
        let wf = linear()
            .with_node(WorkflowNode::new("route", "if"))
            .with_connection(NodeConnection::ports("shape", "main", "route", "main"))
            .with_connection(NodeConnection::ports("route", "maybe", "shape", "input9"));
        let kinds = kinds(&wf);
        assert_eq!(
            kinds.iter().filter(|k| **k == ValidationErrorKind::InvalidPort).count(),
            2
        );
    }

    #[test]
    fn test_cycle_detected() {
        let wf = linear()
            .with_node(WorkflowNode::new("again", "set"))
            .with_connection(NodeConnection::new("shape", "again"))
            .with_connection(NodeConnection::new("again", "shape"));
        let errors = validate_workflow(&wf, &NodeRegistry::new()).unwrap_err();
        assert!(errors.iter().any(|e| e.to_string().contains("cycle detected")));
    }

    #[test]
    fn test_invalid_expression() {
        let mut wf = linear();
        wf.nodes[1].parameters = json!({"values": {"bad": "{{ $json.a + }}", "ok": ["{{ 1 + 1 }}"]}});
        assert_eq!(kinds(&wf), vec![ValidationErrorKind::InvalidExpression]);
    }
}

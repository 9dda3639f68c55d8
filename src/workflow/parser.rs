//! Workflow parser for YAML and JSON definitions.

use std::path::Path;

use super::types::WorkflowDefinition;
use crate::error::{Error, Result};

/// Parse a workflow from a YAML or JSON string.
///
/// Text starting with `{` is read as JSON, anything else as YAML.
pub fn parse_workflow(text: &str) -> Result<WorkflowDefinition> {
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return Err(Error::Parse("Empty workflow definition".to_string()));
    }

    let mut workflow: WorkflowDefinition = if trimmed.starts_with('{') {
        serde_json::from_str(trimmed).map_err(|e| describe(&e.to_string(), "JSON"))?
    } else {
        serde_yaml::from_str(text).map_err(|e| describe(&e.to_string(), "YAML"))?
    };
    workflow.normalize();
    Ok(workflow)
}

/// Parse a workflow from a file path.
pub fn parse_workflow_file(path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow(&content)
}

fn describe(message: &str, format: &str) -> Error {
    match extract_missing_field(message) {
        Some(field) => Error::Parse(format!("Missing required field: {}", field)),
        None => Error::Parse(format!("Invalid {}: {}", format, message)),
    }
}

fn extract_missing_field(error_message: &str) -> Option<&str> {
    let marker = "missing field `";
    let start = error_message.find(marker)? + marker.len();
    let rest = &error_message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}

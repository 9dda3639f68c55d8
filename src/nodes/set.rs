//! Set node - add or update fields on each item.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::types::{Node, NodeContext, NodeMetadata, NodeResult, ParameterSpec};
use crate::error::{Error, Result};

/// Set node implementation.
pub struct SetNode;

impl SetNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SetNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct SetConfig {
    #[serde(default)]
    fields: Vec<SetField>,
    /// Shorthand: `values: {name: value}`
    #[serde(default)]
    values: Map<String, Value>,
    /// Drop the incoming fields and emit only the assigned ones
    #[serde(default)]
    keep_only_set: bool,
}

#[derive(Debug, Deserialize)]
struct SetField {
    name: String,
    value: Value,
}

const PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec::optional("fields", "array", "List of {name, value}; dotted names create nested objects"),
    ParameterSpec::optional("values", "object", "Map of field name to value"),
    ParameterSpec::optional("keep_only_set", "boolean", "Emit only the assigned fields"),
];

#[async_trait]
impl Node for SetNode {
    fn node_type(&self) -> &str {
        "set"
    }

    fn description(&self) -> &str {
        "Set or update fields in object data"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::transform().with_parameters(PARAMETERS)
    }

    async fn execute(&self, params: &Value, ctx: &NodeContext) -> Result<NodeResult> {
        let config: SetConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Validation(format!("Invalid set config: {}", e)))?;

        let assignments: Vec<(&str, &Value)> = config
            .fields
            .iter()
            .map(|f| (f.name.as_str(), &f.value))
            .chain(config.values.iter().map(|(k, v)| (k.as_str(), v)))
            .collect();

        if assignments.is_empty() {
            return Err(Error::Validation(
                "Set node requires at least one field assignment".to_string(),
            ));
        }

        let mut output = match (ctx.item(), config.keep_only_set) {
            (Value::Object(obj), false) => obj.clone(),
            _ => Map::new(),
        };

        for (name, value) in &assignments {
            if name.trim().is_empty() {
                return Err(Error::Validation(
                    "Set node field name cannot be empty".to_string(),
                ));
            }
            set_path_value(&mut output, name, (*value).clone());
        }

        Ok(NodeResult::main(vec![Value::Object(output)])
            .with_metadata(json!({ "fields_set": assignments.len() })))
    }
}

fn set_path_value(root: &mut Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = root;
    for segment in parents {
        let entry = current
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));

        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }

        match entry.as_object_mut() {
            Some(map) => current = map,
            None => return,
        }
    }

    current.insert((*last).to_string(), value);
}

//! Merge node - combine the items of two input ports.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::types::{Node, NodeContext, NodeMetadata, NodeResult, ParameterSpec, MAIN_PORT};
use crate::error::{Error, Result};

/// Merge node implementation.
pub struct MergeNode;

impl MergeNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MergeNode {
    fn default() -> Self {
        Self::new()
    }
}

const INPUT_PORTS: &[&str] = &["input1", "input2"];

#[derive(Debug, Deserialize)]
struct MergeConfig {
    #[serde(default = "default_mode")]
    mode: String, // append | combine_by_index | zip
}

fn default_mode() -> String {
    "append".to_string()
}

const PARAMETERS: &[ParameterSpec] = &[ParameterSpec::optional(
    "mode",
    "string",
    "append | combine_by_index | zip",
)];

#[async_trait]
impl Node for MergeNode {
    fn node_type(&self) -> &str {
        "merge"
    }

    fn description(&self) -> &str {
        "Merge two inputs by append, index-wise combine, or zip"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            inputs: INPUT_PORTS,
            outputs: &[MAIN_PORT],
            trigger: false,
            execute_once: true,
            parameters: PARAMETERS,
        }
    }

    async fn execute(&self, params: &Value, ctx: &NodeContext) -> Result<NodeResult> {
        let config: MergeConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Validation(format!("Invalid merge config: {}", e)))?;
        let mode = config.mode.to_lowercase();
        let sources: Vec<&[Value]> = INPUT_PORTS.iter().map(|p| ctx.input(p)).collect();

        let merged = match mode.as_str() {
            "append" => sources.iter().flat_map(|s| s.iter().cloned()).collect(),
            "combine" | "combine_by_index" => merge_combine(&sources)?,
            "zip" => merge_zip(&sources),
            _ => {
                return Err(Error::Validation(format!(
                    "Invalid merge mode '{}', expected append/combine_by_index/zip",
                    config.mode
                )))
            }
        };

        Ok(NodeResult::main(merged).with_metadata(json!({
            "mode": mode,
            "input_counts": sources.iter().map(|s| s.len()).collect::<Vec<_>>(),
        })))
    }
}

/// Merge item `i` of every input into one object; later inputs win on
/// key conflicts. Length follows the longest input.
fn merge_combine(sources: &[&[Value]]) -> Result<Vec<Value>> {
    let max_len = sources.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut out = Vec::with_capacity(max_len);
    for idx in 0..max_len {
        let mut combined = Map::new();
        for source in sources {
            match source.get(idx) {
                Some(Value::Object(map)) => {
                    combined.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                Some(other) => {
                    return Err(Error::Validation(format!(
                        "merge combine mode requires object items, found {}",
                        type_name(other)
                    )))
                }
                None => {}
            }
        }
        out.push(Value::Object(combined));
    }
    Ok(out)
}

/// Pair items index-wise; length follows the shortest input.
fn merge_zip(sources: &[&[Value]]) -> Vec<Value> {
    let min_len = sources.iter().map(|s| s.len()).min().unwrap_or(0);
    (0..min_len)
        .map(|idx| Value::Array(sources.iter().map(|s| s[idx].clone()).collect()))
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(a: Value, b: Value) -> NodeContext {
        let as_vec = |v: Value| v.as_array().cloned().unwrap_or_default();
        NodeContext::new("exec-1", "wf")
            .with_input("input1", as_vec(a))
            .with_input("input2", as_vec(b))
    }

    #[tokio::test]
    async fn test_merge_append_keeps_port_order() {
        let node = MergeNode::new();
        let result = node
            .execute(&json!({}), &ctx(json!([1, 2]), json!([3, 4])))
            .await
            .unwrap();
        assert_eq!(result.items("main"), &[json!(1), json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn test_merge_combine_by_index() {
        let node = MergeNode::new();
        let result = node
            .execute(
                &json!({"mode": "combine_by_index"}),
                &ctx(json!([{"x": 1}, {"x": 2}]), json!([{"y": 2}])),
            )
            .await
            .unwrap();
        assert_eq!(result.items("main"), &[json!({"x": 1, "y": 2}), json!({"x": 2})]);
    }

    #[tokio::test]
    async fn test_merge_zip() {
        let node = MergeNode::new();
        let result = node
            .execute(&json!({"mode": "zip"}), &ctx(json!([1, 2, 3]), json!(["a", "b"])))
            .await
            .unwrap();
        assert_eq!(result.items("main"), &[json!([1, "a"]), json!([2, "b"])]);
    }

    #[tokio::test]
    async fn test_merge_rejects_unknown_mode() {
        let node = MergeNode::new();
        assert!(node
            .execute(&json!({"mode": "interleave"}), &ctx(json!([]), json!([])))
            .await
            .is_err());
    }
}

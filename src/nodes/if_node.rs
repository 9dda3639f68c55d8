//! IF node - route each item to the `true` or `false` port.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::types::{Node, NodeContext, NodeMetadata, NodeResult, ParameterSpec, MAIN_PORT};
use crate::error::{Error, Result};
use crate::expression::functions::is_truthy;

/// IF node implementation.
pub struct IfNode;

impl IfNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for IfNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct IfConfig {
    /// Resolved expression; truthiness picks the branch
    #[serde(default)]
    condition: Option<Value>,
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default = "default_match_mode")]
    match_mode: String, // "all" | "any"
}

#[derive(Debug, Deserialize)]
struct Condition {
    /// Left operand, usually `{{ $json.field }}`
    field: Value,
    operator: String,
    #[serde(default)]
    value: Value,
}

fn default_match_mode() -> String {
    "all".to_string()
}

const PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec::optional("condition", "expression", "Truthy value routes to 'true'"),
    ParameterSpec::optional("conditions", "array", "List of {field, operator, value}"),
    ParameterSpec::optional("match_mode", "string", "all | any"),
];

#[async_trait]
impl Node for IfNode {
    fn node_type(&self) -> &str {
        "if"
    }

    fn description(&self) -> &str {
        "Evaluate a condition and route items to the true or false output"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            inputs: &[MAIN_PORT],
            outputs: &["true", "false"],
            trigger: false,
            execute_once: false,
            parameters: PARAMETERS,
        }
    }

    async fn execute(&self, params: &Value, ctx: &NodeContext) -> Result<NodeResult> {
        let config: IfConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Validation(format!("Invalid if config: {}", e)))?;

        let passed = match (&config.condition, config.conditions.is_empty()) {
            (Some(condition), _) => is_truthy(condition),
            (None, false) => {
                let match_mode = config.match_mode.to_lowercase();
                let mut results = Vec::with_capacity(config.conditions.len());
                for condition in &config.conditions {
                    results.push(evaluate_condition(
                        &condition.field,
                        &condition.operator,
                        &condition.value,
                    )?);
                }
                match match_mode.as_str() {
                    "all" => results.iter().all(|r| *r),
                    "any" => results.iter().any(|r| *r),
                    _ => {
                        return Err(Error::Validation(format!(
                            "Invalid match_mode '{}', expected 'all' or 'any'",
                            config.match_mode
                        )))
                    }
                }
            }
            (None, true) => {
                return Err(Error::Validation(
                    "IF node requires 'condition' or at least one entry in 'conditions'".to_string(),
                ))
            }
        };

        let branch = if passed { "true" } else { "false" };
        Ok(NodeResult::port(branch, vec![ctx.item().clone()])
            .with_metadata(json!({ "condition_result": passed })))
    }
}

fn evaluate_condition(left: &Value, operator: &str, right: &Value) -> Result<bool> {
    match operator {
        "equals" => Ok(left == right),
        "not_equals" => Ok(left != right),
        "contains" => match left {
            Value::String(s) => Ok(right
                .as_str()
                .map(|needle| s.contains(needle))
                .unwrap_or(false)),
            Value::Array(items) => Ok(items.contains(right)),
            Value::Object(map) => Ok(right.as_str().map(|k| map.contains_key(k)).unwrap_or(false)),
            _ => Ok(false),
        },
        "exists" => Ok(!left.is_null()),
        "is_empty" => Ok(!is_truthy(left) || left.as_array().is_some_and(Vec::is_empty)),
        "gt" | "lt" | "gte" | "lte" => {
            let l = as_f64(left).ok_or_else(|| {
                Error::Validation(format!("Operator '{}' requires numeric left operand", operator))
            })?;
            let r = as_f64(right).ok_or_else(|| {
                Error::Validation(format!("Operator '{}' requires numeric right operand", operator))
            })?;
            Ok(match operator {
                "gt" => l > r,
                "lt" => l < r,
                "gte" => l >= r,
                _ => l <= r,
            })
        }
        "regex" => {
            let pattern = right.as_str().ok_or_else(|| {
                Error::Validation("regex operator requires string pattern".to_string())
            })?;
            let text = match left {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let regex = regex_lite::Regex::new(pattern)
                .map_err(|e| Error::Validation(format!("Invalid regex '{}': {}", pattern, e)))?;
            Ok(regex.is_match(&text))
        }
        _ => Err(Error::Validation(format!("Unsupported operator '{}'", operator))),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

static NULL: Value = Value::Null;

/// Environment variable prefix that is always visible to `$env`.
pub const ENV_PREFIX: &str = "FLOWRUN_";

/// Per-run data shared by every expression evaluated in that run.
///
/// The scheduler appends each node's output under the node's name once the
/// node finishes, so later nodes can read it through `$node["name"]`.
#[derive(Debug, Clone, Default)]
pub struct ExpressionScope {
    pub workflow: Value,
    pub execution: Value,
    pub variables: Value,
    pub env: Value,
    pub node_outputs: HashMap<String, Vec<Value>>,
}

impl ExpressionScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow(mut self, workflow: Value) -> Self {
        self.workflow = workflow;
        self
    }

    pub fn with_execution(mut self, execution: Value) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_env(mut self, env: Map<String, Value>) -> Self {
        self.env = Value::Object(env);
        self
    }

    pub fn record_output(&mut self, node_name: &str, items: Vec<Value>) {
        self.node_outputs.insert(node_name.to_string(), items);
    }

    pub fn node_output(&self, node_name: &str) -> Option<&[Value]> {
        self.node_outputs.get(node_name).map(Vec::as_slice)
    }
}

/// Snapshot the process environment visible to `$env`.
///
/// Only `FLOWRUN_*` variables and names in `allowlist` are included.
pub fn collect_env(allowlist: &[String]) -> Map<String, Value> {
    std::env::vars()
        .filter(|(name, _)| is_safe_env_var(name, allowlist))
        .map(|(name, value)| (name, Value::String(value)))
        .collect()
}

pub fn is_safe_env_var(name: &str, allowlist: &[String]) -> bool {
    name.starts_with(ENV_PREFIX) || allowlist.iter().any(|allowed| allowed == name)
}

/// Read-only view handed to the interpreter for one item.
#[derive(Debug, Clone, Copy)]
pub struct ExpressionContext<'a> {
    pub scope: &'a ExpressionScope,
    pub item: &'a Value,
    pub item_index: usize,
    pub input: &'a [Value],
    pub now: DateTime<Utc>,
}

impl<'a> ExpressionContext<'a> {
    /// Context for item `item_index` of an input batch.
    pub fn new(scope: &'a ExpressionScope, input: &'a [Value], item_index: usize) -> Self {
        Self {
            scope,
            item: input.get(item_index).unwrap_or(&NULL),
            item_index,
            input,
            now: Utc::now(),
        }
    }

    /// Context for a lone item with no surrounding batch.
    pub fn for_item(scope: &'a ExpressionScope, item: &'a Value) -> Self {
        Self {
            scope,
            item,
            item_index: 0,
            input: std::slice::from_ref(item),
            now: Utc::now(),
        }
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_env_allowlist() {
        let allow = vec!["HOME".to_string()];
        assert!(is_safe_env_var("FLOWRUN_API_BASE", &[]));
        assert!(is_safe_env_var("HOME", &allow));
        assert!(!is_safe_env_var("AWS_SECRET_ACCESS_KEY", &allow));
    }

    #[test]
    fn test_context_out_of_range_item_is_null() {
        let scope = ExpressionScope::new();
        let items = vec![json!({"a": 1})];
        let ctx = ExpressionContext::new(&scope, &items, 5);
        assert!(ctx.item.is_null());
        assert_eq!(ctx.input.len(), 1);
    }
}

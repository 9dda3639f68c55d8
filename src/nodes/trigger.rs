//! Trigger nodes.
//!
//! Triggers start a run; the engine hands them the run's input items. An
//! empty input becomes a single empty item so the run always has
//! something to flow. Path routing and cron matching live outside the
//! engine, in whatever calls `Engine::trigger`.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};

use super::types::{Node, NodeContext, NodeMetadata, NodeResult, ParameterSpec};
use crate::error::Result;

fn seed_items(ctx: &NodeContext) -> Vec<Value> {
    if ctx.items.is_empty() {
        vec![Value::Object(Map::new())]
    } else {
        ctx.items.clone()
    }
}

/// Webhook trigger: emits the request payload delivered by the caller.
pub struct WebhookTriggerNode;

const WEBHOOK_PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec::optional("path", "string", "Webhook path, matched by the HTTP layer"),
    ParameterSpec::optional("method", "string", "Accepted HTTP method"),
];

#[async_trait]
impl Node for WebhookTriggerNode {
    fn node_type(&self) -> &str {
        "webhook"
    }

    fn description(&self) -> &str {
        "Start a run from an incoming HTTP request"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::trigger().with_parameters(WEBHOOK_PARAMETERS)
    }

    async fn execute(&self, _params: &Value, ctx: &NodeContext) -> Result<NodeResult> {
        Ok(NodeResult::main(seed_items(ctx)))
    }
}

/// Manual trigger: emits whatever input the operator supplied.
pub struct ManualTriggerNode;

#[async_trait]
impl Node for ManualTriggerNode {
    fn node_type(&self) -> &str {
        "manual"
    }

    fn description(&self) -> &str {
        "Start a run by hand (CLI or API)"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::trigger()
    }

    async fn execute(&self, _params: &Value, ctx: &NodeContext) -> Result<NodeResult> {
        Ok(NodeResult::main(seed_items(ctx)))
    }
}

/// Schedule trigger: stamps each item with the firing time.
pub struct ScheduleTriggerNode;

const SCHEDULE_PARAMETERS: &[ParameterSpec] = &[ParameterSpec::optional(
    "cron",
    "string",
    "Cron expression, evaluated by the external scheduler",
)];

#[async_trait]
impl Node for ScheduleTriggerNode {
    fn node_type(&self) -> &str {
        "schedule"
    }

    fn description(&self) -> &str {
        "Start a run on a schedule"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::trigger().with_parameters(SCHEDULE_PARAMETERS)
    }

    async fn execute(&self, _params: &Value, ctx: &NodeContext) -> Result<NodeResult> {
        let timestamp = Utc::now().to_rfc3339();
        let items = seed_items(ctx)
            .into_iter()
            .map(|item| match item {
                Value::Object(mut map) => {
                    map.entry("timestamp")
                        .or_insert_with(|| Value::String(timestamp.clone()));
                    Value::Object(map)
                }
                other => json!({ "timestamp": timestamp, "value": other }),
            })
            .collect();
        Ok(NodeResult::main(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_triggers_seed_empty_item() {
        let ctx = NodeContext::new("e", "w");
        let result = WebhookTriggerNode.execute(&json!({}), &ctx).await.unwrap();
        assert_eq!(result.items("main"), &[json!({})]);
        assert!(WebhookTriggerNode.metadata().trigger);
        assert!(WebhookTriggerNode.metadata().inputs.is_empty());
    }

    #[tokio::test]
    async fn test_manual_passes_input() {
        let ctx = NodeContext::new("e", "w").with_items(vec![json!({"a": 1}), json!({"a": 2})]);
        let result = ManualTriggerNode.execute(&json!({}), &ctx).await.unwrap();
        assert_eq!(result.items("main").len(), 2);
    }

    #[tokio::test]
    async fn test_schedule_stamps_items() {
        let ctx = NodeContext::new("e", "w");
        let result = ScheduleTriggerNode.execute(&json!({}), &ctx).await.unwrap();
        assert!(result.items("main")[0]["timestamp"].is_string());
    }
}

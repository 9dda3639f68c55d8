//! End-to-end runs through the engine, the queue, and a worker.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use flowrun::engine::{Engine, MonitorEvent};
use flowrun::nodes::{HttpNode, Node, NodeContext, NodeRegistry, NodeResult};
use flowrun::queue::{InMemoryQueue, JobOutcome, Worker};
use flowrun::storage::{ExecutionMode, ExecutionStatus, MemoryStorage, NodeStatus, Storage};
use flowrun::workflow::{
    parse_workflow, NodeConnection, ValidationErrorKind, WorkflowDefinition, WorkflowNode,
};
use flowrun::{Error, Result};

struct RejectNode;

#[async_trait]
impl Node for RejectNode {
    fn node_type(&self) -> &str {
        "reject"
    }

    async fn execute(&self, _params: &Value, _ctx: &NodeContext) -> Result<NodeResult> {
        Err(Error::Validation("order total must be positive".into()))
    }
}

fn engine() -> Arc<Engine> {
    let mut registry = NodeRegistry::new();
    registry.register(Arc::new(HttpNode::new().allow_internal(true)));
    registry.register(Arc::new(RejectNode));
    Arc::new(
        Engine::builder(Arc::new(MemoryStorage::new()), Arc::new(InMemoryQueue::new()))
            .registry(registry)
            .build(),
    )
}

async fn run_once(engine: &Arc<Engine>, workflow_id: &str, input: Value) -> String {
    let id = engine
        .trigger(workflow_id, ExecutionMode::Webhook, input, None)
        .await
        .unwrap();
    let outcome = Worker::new(0, engine.clone())
        .process_next(&CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Completed(_))));
    id
}

#[tokio::test]
async fn webhook_set_http_pipeline() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/orders")
        .match_body(mockito::Matcher::Json(json!({"x": 1})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"accepted": true}"#)
        .create_async()
        .await;

    let yaml = format!(
        r#"
id: order-sync
name: Order sync
nodes:
  - id: hook
    type: webhook
  - id: shape
    type: set
    parameters:
      keep_only_set: true
      values:
        x: 1
  - id: forward
    type: http
    parameters:
      url: "{}/orders"
      method: POST
      body: "{{{{ $json }}}}"
connections:
  - from: hook
    to: shape
  - from: shape
    to: forward
"#,
        server.url()
    );
    let workflow = parse_workflow(&yaml).unwrap();

    let engine = engine();
    engine.register_workflow(&workflow).await.unwrap();
    let id = run_once(&engine, "order-sync", json!({"order": 42, "noise": true})).await;

    mock.assert_async().await;
    let run = engine.storage().get_run(&id).await.unwrap().unwrap();
    assert_eq!(run.status, ExecutionStatus::Success);
    assert_eq!(run.nodes.len(), 3);
    assert!(run.nodes.iter().all(|n| n.status == NodeStatus::Success));
    assert_eq!(run.node("forward").unwrap().input, vec![json!({"x": 1})]);
    assert_eq!(run.summary().nodes_succeeded, 3);
}

fn reject_pipeline(continue_on_fail: bool) -> WorkflowDefinition {
    WorkflowDefinition::new("checkout", "Checkout")
        .with_node(WorkflowNode::new("hook", "webhook"))
        .with_node(WorkflowNode::new("check", "reject").with_continue_on_fail(continue_on_fail))
        .with_node(
            WorkflowNode::new("tag", "set")
                .with_parameters(json!({"values": {"checked": true}})),
        )
        .with_connection(NodeConnection::new("hook", "check"))
        .with_connection(NodeConnection::new("check", "tag"))
}

#[tokio::test]
async fn failure_halts_run_without_continue_on_fail() {
    let engine = engine();
    engine.register_workflow(&reject_pipeline(false)).await.unwrap();
    let id = run_once(&engine, "checkout", json!({"total": -5})).await;

    let run = engine.storage().get_run(&id).await.unwrap().unwrap();
    assert_eq!(run.status, ExecutionStatus::Error);
    assert!(run.error.as_deref().unwrap().contains("order total must be positive"));

    let check = run.node("check").unwrap();
    assert_eq!(check.status, NodeStatus::Error);
    let detail = check.error.as_ref().unwrap();
    assert_eq!(detail.category, "validation");
    assert_eq!(detail.retry_count, 0);
    assert_eq!(run.node("tag").unwrap().status, NodeStatus::Skipped);
}

#[tokio::test]
async fn continue_on_fail_passes_annotated_items_downstream() {
    let engine = engine();
    engine.register_workflow(&reject_pipeline(true)).await.unwrap();
    let id = run_once(&engine, "checkout", json!({"total": -5})).await;

    let run = engine.storage().get_run(&id).await.unwrap().unwrap();
    assert_eq!(run.status, ExecutionStatus::Success);

    let tag = run.node("tag").unwrap();
    assert_eq!(tag.status, NodeStatus::Success);
    assert_eq!(tag.input.len(), 1);
    assert_eq!(tag.input[0]["total"], -5);
    assert_eq!(tag.input[0]["error"]["category"], "validation");
    assert_eq!(tag.output["main"][0]["checked"], true);
}

#[tokio::test]
async fn workflow_without_trigger_is_rejected() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("no-trigger", "No trigger")
        .with_node(WorkflowNode::new("a", "set"))
        .with_node(WorkflowNode::new("b", "set"))
        .with_connection(NodeConnection::new("a", "b"));

    let Err(Error::InvalidWorkflow(errors)) = engine.register_workflow(&workflow).await else {
        panic!("expected validation failure");
    };
    assert!(errors.iter().any(|e| e.kind == ValidationErrorKind::MissingTrigger));
    assert!(engine.storage().get_workflow("no-trigger").await.unwrap().is_none());
}

#[tokio::test]
async fn connection_to_unknown_node_is_rejected() {
    let engine = engine();
    let workflow = WorkflowDefinition::new("dangling", "Dangling")
        .with_node(WorkflowNode::new("hook", "webhook"))
        .with_connection(NodeConnection::new("hook", "ghost"));

    let Err(Error::InvalidWorkflow(errors)) = engine.register_workflow(&workflow).await else {
        panic!("expected validation failure");
    };
    let error = errors
        .iter()
        .find(|e| e.kind == ValidationErrorKind::InvalidConnection)
        .unwrap();
    assert!(error.message.contains("ghost"));
}

#[tokio::test]
async fn monitor_reports_run_lifecycle() {
    let engine = engine();
    engine.register_workflow(&reject_pipeline(true)).await.unwrap();
    let mut events = engine.monitor().subscribe();

    let id = run_once(&engine, "checkout", json!({"total": 1})).await;

    let mut started = false;
    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        match event {
            MonitorEvent::ExecutionStarted { execution_id, .. } => started = execution_id == id,
            MonitorEvent::ExecutionCompleted { status, .. } => completed = Some(status),
            _ => {}
        }
    }
    assert!(started);
    assert_eq!(completed, Some(ExecutionStatus::Success));
}

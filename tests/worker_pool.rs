//! Worker pool draining a queue into SQLite storage.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use flowrun::engine::Engine;
use flowrun::queue::{InMemoryQueue, WorkerPool};
use flowrun::shutdown::ShutdownCoordinator;
use flowrun::storage::{ExecutionMode, ExecutionStatus, SqliteStorage, Storage};
use flowrun::workflow::{NodeConnection, WorkflowDefinition, WorkflowNode};

fn workflow() -> WorkflowDefinition {
    WorkflowDefinition::new("double", "Double")
        .with_node(WorkflowNode::new("start", "manual"))
        .with_node(
            WorkflowNode::new("calc", "set")
                .with_parameters(json!({"values": {"doubled": "{{ $json.n * 2 }}"}})),
        )
        .with_connection(NodeConnection::new("start", "calc"))
}

#[tokio::test]
async fn pool_runs_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.db");

    let storage = Arc::new(SqliteStorage::open(&path).unwrap());
    let engine = Arc::new(Engine::builder(storage, Arc::new(InMemoryQueue::new())).build());
    engine.register_workflow(&workflow()).await.unwrap();

    let mut ids = Vec::new();
    for n in 1..=4 {
        let id = engine
            .trigger("double", ExecutionMode::Manual, json!({"n": n}), None)
            .await
            .unwrap();
        ids.push((id, n));
    }

    let shutdown = ShutdownCoordinator::new();
    let pool = WorkerPool::start(engine.clone(), 2, shutdown.token());

    for _ in 0..300 {
        let mut settled = 0;
        for (id, _) in &ids {
            if let Some(run) = engine.storage().get_run(id).await.unwrap() {
                if run.status.is_terminal() {
                    settled += 1;
                }
            }
        }
        if settled == ids.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.request_shutdown();
    assert!(shutdown.drain(pool, Duration::from_secs(5)).await);
    drop(engine);

    let reopened = SqliteStorage::open(&path).unwrap();
    for (id, n) in &ids {
        let run = reopened.get_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, ExecutionStatus::Success);
        let calc = run.node("calc").unwrap();
        assert_eq!(calc.output["main"][0]["doubled"], json!(n * 2));
    }
    assert_eq!(reopened.list_runs("double", 10).await.unwrap().len(), 4);
}

//! Queue workers: pull jobs, drive runs, settle deliveries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::job::{Delivery, Job, NackOutcome};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::metrics;
use crate::resilience::{classify_error, RetryOptions};
use crate::storage::{ExecutionRun, ExecutionStatus};

/// Service name the storage calls are tracked under.
const STORAGE_SERVICE: &str = "storage";

/// Pause after a queue backend error before polling again.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// How one delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The run reached this terminal status and was persisted.
    Completed(ExecutionStatus),
    /// The run was already terminal; duplicate delivery.
    Skipped,
    Requeued { attempt: u32, delay: Duration },
    DeadLettered,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed(_) => "completed",
            JobOutcome::Skipped => "skipped",
            JobOutcome::Requeued { .. } => "requeued",
            JobOutcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Owns at most one run at a time.
#[derive(Clone)]
pub struct Worker {
    id: usize,
    engine: Arc<Engine>,
}

impl Worker {
    pub fn new(id: usize, engine: Arc<Engine>) -> Self {
        Self { id, engine }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Execute the run a job points at.
    ///
    /// Returns `Ok(None)` when the run is no longer running, which makes
    /// repeated deliveries harmless. On failure the run is persisted with
    /// status Error before the error is returned.
    #[instrument(name = "worker.process", skip(self, job), fields(worker = self.id, execution_id = %job.execution_id))]
    pub async fn process(&self, job: &Job) -> Result<Option<ExecutionStatus>> {
        let Some(mut run) = self.load_run(&job.execution_id).await? else {
            return Err(Error::Execution(format!(
                "Execution not found: {}",
                job.execution_id
            )));
        };
        if run.status != ExecutionStatus::Running {
            debug!(status = %run.status, "Run already settled, skipping delivery");
            return Ok(None);
        }

        let token = self.engine.cancellations().register(&run.id);
        let result = self.engine.executor().execute_run(&mut run, &token).await;
        self.engine.cancellations().unregister(&run.id);

        match result {
            Ok(()) => {
                self.persist(&run).await?;
                if run.status == ExecutionStatus::Error {
                    self.engine.trigger_error_workflow(&run).await;
                }
                Ok(Some(run.status))
            }
            Err(e) => {
                self.fail_run(&mut run, &e).await;
                Err(e)
            }
        }
    }

    /// Receive one delivery, run it, and ack, nack, or dead-letter it.
    /// Returns `Ok(None)` once `shutdown` fires.
    pub async fn process_next(&self, shutdown: &CancellationToken) -> Result<Option<JobOutcome>> {
        let Some(delivery) = self.engine.queue().receive(shutdown).await else {
            return Ok(None);
        };
        let outcome = self.settle(delivery).await?;
        metrics::record_job(outcome.as_str());
        Ok(Some(outcome))
    }

    /// Process deliveries until `shutdown` fires. The run in hand is
    /// finished before returning.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker = self.id, "Worker started");
        loop {
            match self.process_next(&shutdown).await {
                Ok(Some(outcome)) => debug!(worker = self.id, outcome = outcome.as_str(), "Job settled"),
                Ok(None) => break,
                Err(e) => {
                    error!(worker = self.id, "Queue error: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(QUEUE_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        info!(worker = self.id, "Worker stopped");
    }

    async fn settle(&self, delivery: Delivery) -> Result<JobOutcome> {
        let queue = self.engine.queue();
        let worker = self.clone();
        let job = delivery.job.clone();
        // A panicking run is reported like any other failure.
        let result = match tokio::spawn(async move { worker.process(&job).await }).await {
            Ok(result) => result,
            Err(join_error) => {
                let e = Error::Internal(format!("Run panicked: {}", join_error));
                self.engine.cancellations().unregister(&delivery.job.execution_id);
                self.mark_failed(&delivery.job.execution_id, &e).await;
                Err(e)
            }
        };

        match result {
            Ok(Some(status)) => {
                queue.ack(&delivery).await?;
                Ok(JobOutcome::Completed(status))
            }
            Ok(None) => {
                queue.ack(&delivery).await?;
                Ok(JobOutcome::Skipped)
            }
            Err(e) => {
                let message = e.to_string();
                if !classify_error(&e).is_retryable {
                    queue.dead_letter(delivery, &message).await?;
                    return Ok(JobOutcome::DeadLettered);
                }
                match queue.nack(delivery, &message).await? {
                    NackOutcome::Requeued { attempt, delay } => {
                        warn!(attempt, ?delay, "Job failed, redelivery scheduled: {}", message);
                        Ok(JobOutcome::Requeued { attempt, delay })
                    }
                    NackOutcome::DeadLettered => Ok(JobOutcome::DeadLettered),
                }
            }
        }
    }

    async fn load_run(&self, execution_id: &str) -> Result<Option<ExecutionRun>> {
        let storage = self.engine.storage();
        self.engine
            .resilience()
            .run_with_retry(
                RetryOptions::new().service(Some(STORAGE_SERVICE.to_string())),
                |_| storage.get_run(execution_id),
            )
            .await
            .result
    }

    /// Save a terminal run, dropping node records the save policy excludes.
    async fn persist(&self, run: &ExecutionRun) -> Result<()> {
        let failed = run.status == ExecutionStatus::Error;
        let slim;
        let to_save = if run.workflow.settings.save_policy.keeps_nodes(failed) {
            run
        } else {
            slim = ExecutionRun {
                nodes: Vec::new(),
                ..run.clone()
            };
            &slim
        };

        let storage = self.engine.storage();
        self.engine
            .resilience()
            .run_with_retry(
                RetryOptions::new().service(Some(STORAGE_SERVICE.to_string())),
                |_| storage.save_run(to_save),
            )
            .await
            .result
    }

    async fn fail_run(&self, run: &mut ExecutionRun, e: &Error) {
        if !run.status.is_terminal() {
            run.finish(ExecutionStatus::Error, Some(e.to_string()));
        }
        error!(execution_id = %run.id, "Execution failed: {}", e);
        self.engine
            .monitor()
            .execution_failed(&run.id, &run.workflow_id, &e.to_string());
        if let Err(persist_error) = self.persist(run).await {
            error!(execution_id = %run.id, "Failed to persist error status: {}", persist_error);
            return;
        }
        self.engine.trigger_error_workflow(run).await;
    }

    async fn mark_failed(&self, execution_id: &str, e: &Error) {
        match self.load_run(execution_id).await {
            Ok(Some(mut run)) if run.status == ExecutionStatus::Running => {
                self.fail_run(&mut run, e).await;
            }
            Ok(_) => {}
            Err(load_error) => {
                error!(execution_id, "Failed to load run after panic: {}", load_error);
            }
        }
    }
}

/// A fixed set of workers draining one queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn `concurrency` workers. They stop taking jobs when `shutdown`
    /// fires.
    pub fn start(engine: Arc<Engine>, concurrency: usize, shutdown: CancellationToken) -> Self {
        let concurrency = concurrency.max(1);
        info!(concurrency, "Starting worker pool");
        let handles = (0..concurrency)
            .map(|id| {
                let worker = Worker::new(id, engine.clone());
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect();
        Self { handles, shutdown }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every worker to finish its current run and exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{Node, NodeContext, NodeRegistry, NodeResult};
    use crate::queue::{InMemoryQueue, JobQueue};
    use crate::storage::{ExecutionMode, MemoryStorage, NodeStatus, Storage};
    use crate::workflow::{NodeConnection, SavePolicy, WorkflowDefinition, WorkflowNode};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct BrokenNode;

    #[async_trait]
    impl Node for BrokenNode {
        fn node_type(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "Always fails validation"
        }

        async fn execute(&self, _params: &Value, _ctx: &NodeContext) -> Result<NodeResult> {
            Err(Error::Validation("bad input".into()))
        }
    }

    fn engine_with(queue: Arc<InMemoryQueue>) -> Arc<Engine> {
        let mut registry = NodeRegistry::new();
        registry.register(Arc::new(BrokenNode));
        Arc::new(
            Engine::builder(Arc::new(MemoryStorage::new()), queue)
                .registry(registry)
                .build(),
        )
    }

    fn workflow(id: &str, second: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(id, id)
            .with_node(WorkflowNode::new("start", "manual"))
            .with_node(
                WorkflowNode::new("step", second).with_parameters(json!({"values": {"ok": true}})),
            )
            .with_connection(NodeConnection::new("start", "step"))
    }

    #[tokio::test]
    async fn test_worker_completes_run_and_acks() {
        let queue = Arc::new(InMemoryQueue::new());
        let engine = engine_with(queue.clone());
        engine.register_workflow(&workflow("wf", "set")).await.unwrap();
        let id = engine
            .trigger("wf", ExecutionMode::Manual, json!({"n": 1}), None)
            .await
            .unwrap();

        let worker = Worker::new(0, engine.clone());
        let outcome = worker.process_next(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::Completed(ExecutionStatus::Success)));
        assert_eq!(queue.in_flight(), 0);

        let run = engine.storage().get_run(&id).await.unwrap().unwrap();
        assert_eq!(run.status, ExecutionStatus::Success);
        assert_eq!(run.node("step").unwrap().status, NodeStatus::Success);
        assert_eq!(run.node("step").unwrap().input, vec![json!({"n": 1})]);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_noop() {
        let queue = Arc::new(InMemoryQueue::new());
        let engine = engine_with(queue.clone());
        engine.register_workflow(&workflow("wf", "set")).await.unwrap();
        let id = engine.trigger("wf", ExecutionMode::Manual, Value::Null, None).await.unwrap();

        let worker = Worker::new(0, engine.clone());
        let job = Job {
            execution_id: id.clone(),
            workflow_id: "wf".into(),
            mode: ExecutionMode::Manual,
            input_data: Value::Null,
            trigger_node: None,
        };
        assert_eq!(worker.process(&job).await.unwrap(), Some(ExecutionStatus::Success));
        let first = engine.storage().get_run(&id).await.unwrap().unwrap();

        assert_eq!(worker.process(&job).await.unwrap(), None);
        let second = engine.storage().get_run(&id).await.unwrap().unwrap();
        assert_eq!(first.finished_at, second.finished_at);
    }

    #[tokio::test]
    async fn test_node_failure_is_a_completed_job() {
        let queue = Arc::new(InMemoryQueue::new());
        let engine = engine_with(queue.clone());
        engine.register_workflow(&workflow("wf", "broken")).await.unwrap();
        let id = engine.trigger("wf", ExecutionMode::Manual, json!({}), None).await.unwrap();

        let outcome = Worker::new(0, engine.clone())
            .process_next(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Some(JobOutcome::Completed(ExecutionStatus::Error)));

        let run = engine.storage().get_run(&id).await.unwrap().unwrap();
        assert_eq!(run.status, ExecutionStatus::Error);
        assert!(run.error.unwrap().contains("bad input"));
        assert!(queue.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_run_is_dead_lettered() {
        let queue = Arc::new(InMemoryQueue::new());
        let engine = engine_with(queue.clone());
        queue
            .enqueue(Job {
                execution_id: "ghost".into(),
                workflow_id: "wf".into(),
                mode: ExecutionMode::Manual,
                input_data: Value::Null,
                trigger_node: None,
            })
            .await
            .unwrap();

        let outcome = Worker::new(0, engine)
            .process_next(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, Some(JobOutcome::DeadLettered));
        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].error.contains("ghost"));
    }

    #[tokio::test]
    async fn test_invalid_snapshot_persists_error() {
        let queue = Arc::new(InMemoryQueue::new());
        let engine = engine_with(queue.clone());
        // Stored directly, bypassing registration checks
        let wf = WorkflowDefinition::new("bad", "bad").with_node(WorkflowNode::new("a", "set"));
        engine.storage().save_workflow(&wf).await.unwrap();
        let run = ExecutionRun::new(&wf, ExecutionMode::Manual, json!({}));
        engine.storage().save_run(&run).await.unwrap();

        let job = Job {
            execution_id: run.id.clone(),
            workflow_id: "bad".into(),
            mode: ExecutionMode::Manual,
            input_data: json!({}),
            trigger_node: None,
        };
        let err = Worker::new(0, engine.clone()).process(&job).await.unwrap_err();
        assert!(matches!(err, Error::InvalidWorkflow(_)));

        let stored = engine.storage().get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Error);
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_save_policy_none_drops_node_records() {
        let queue = Arc::new(InMemoryQueue::new());
        let engine = engine_with(queue);
        let mut wf = workflow("wf", "set");
        wf.settings.save_policy = SavePolicy::None;
        engine.register_workflow(&wf).await.unwrap();
        let id = engine.trigger("wf", ExecutionMode::Manual, json!({}), None).await.unwrap();

        Worker::new(0, engine.clone())
            .process_next(&CancellationToken::new())
            .await
            .unwrap();
        let run = engine.storage().get_run(&id).await.unwrap().unwrap();
        assert_eq!(run.status, ExecutionStatus::Success);
        assert!(run.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let queue = Arc::new(InMemoryQueue::new());
        let engine = engine_with(queue.clone());
        engine.register_workflow(&workflow("wf", "set")).await.unwrap();
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(
                engine
                    .trigger("wf", ExecutionMode::Manual, json!({"n": n}), None)
                    .await
                    .unwrap(),
            );
        }

        let shutdown = CancellationToken::new();
        let pool = WorkerPool::start(engine.clone(), 3, shutdown.clone());
        assert_eq!(pool.len(), 3);

        for _ in 0..200 {
            let mut done = 0;
            for id in &ids {
                let run = engine.storage().get_run(id).await.unwrap().unwrap();
                if run.status.is_terminal() {
                    done += 1;
                }
            }
            if done == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.shutdown();
        pool.join().await;
        for id in &ids {
            let run = engine.storage().get_run(id).await.unwrap().unwrap();
            assert_eq!(run.status, ExecutionStatus::Success);
        }
        assert_eq!(queue.pending(), 0);
    }
}

//! The engine facade: workflow registration, triggering, cancellation.
//!
//! Trigger sources (webhook routers, schedulers, the CLI) call
//! [`Engine::trigger`], which snapshots the workflow into a persisted run
//! and enqueues a job. Workers pick jobs up and drive the [`Executor`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use super::cancel::CancellationRegistry;
use super::executor::Executor;
use super::monitor::Monitor;
use crate::credentials::CredentialProvider;
use crate::error::{Error, Result};
use crate::nodes::NodeRegistry;
use crate::queue::{Job, JobQueue};
use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitTransition, Resilience, RetryPolicy,
};
use crate::storage::{ExecutionMode, ExecutionRun, ExecutionStatus, NodeStatus, Storage};
use crate::workflow::{validate_workflow, WorkflowDefinition};

/// How long `cancel` waits for a delivered run to reach its worker.
const CANCEL_HANDOFF_ATTEMPTS: u32 = 10;
const CANCEL_HANDOFF_INTERVAL: Duration = Duration::from_millis(10);

/// Builder for [`Engine`].
pub struct EngineBuilder {
    storage: Arc<dyn Storage>,
    queue: Arc<dyn JobQueue>,
    registry: NodeRegistry,
    breaker_config: CircuitBreakerConfig,
    retry_policy: RetryPolicy,
    credentials: Option<Arc<dyn CredentialProvider>>,
    env: Map<String, Value>,
}

impl EngineBuilder {
    pub fn registry(mut self, registry: NodeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Values exposed to expressions as `$env`.
    pub fn env(mut self, env: Map<String, Value>) -> Self {
        self.env = env;
        self
    }

    pub fn build(self) -> Engine {
        let monitor = Arc::new(Monitor::new());
        let breakers = Arc::new(CircuitBreakerRegistry::with_config(self.breaker_config));
        let observer = monitor.clone();
        breakers.set_observer(Arc::new(move |transition: &CircuitTransition| {
            observer.circuit_changed(transition)
        }));

        let resilience = Resilience::new(breakers, self.retry_policy);
        let mut executor = Executor::new(Arc::new(self.registry), resilience.clone())
            .with_monitor(monitor.clone())
            .with_env(self.env);
        if let Some(provider) = self.credentials {
            executor = executor.with_credentials(provider);
        }

        Engine {
            storage: self.storage,
            queue: self.queue,
            executor,
            resilience,
            cancellations: CancellationRegistry::new(),
            monitor,
        }
    }
}

/// Shared handle to storage, queue, executor, and resilience state.
pub struct Engine {
    storage: Arc<dyn Storage>,
    queue: Arc<dyn JobQueue>,
    executor: Executor,
    resilience: Resilience,
    cancellations: CancellationRegistry,
    monitor: Arc<Monitor>,
}

impl Engine {
    pub fn builder(storage: Arc<dyn Storage>, queue: Arc<dyn JobQueue>) -> EngineBuilder {
        EngineBuilder {
            storage,
            queue,
            registry: NodeRegistry::new(),
            breaker_config: CircuitBreakerConfig::default(),
            retry_policy: RetryPolicy::default(),
            credentials: None,
            env: Map::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn resilience(&self) -> &Resilience {
        &self.resilience
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Validate and store a workflow definition.
    pub async fn register_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        validate_workflow(workflow, self.executor.registry()).map_err(Error::InvalidWorkflow)?;
        self.storage.save_workflow(workflow).await?;
        info!(workflow_id = %workflow.id, "Workflow registered");
        Ok(())
    }

    /// Turn non-manual triggering on or off. Activation re-validates.
    pub async fn set_active(&self, workflow_id: &str, active: bool) -> Result<()> {
        let mut workflow = self.load_workflow(workflow_id).await?;
        if active {
            validate_workflow(&workflow, self.executor.registry()).map_err(Error::InvalidWorkflow)?;
        }
        workflow.active = active;
        self.storage.save_workflow(&workflow).await
    }

    /// Create a run of `workflow_id` and enqueue it. Returns the execution id.
    ///
    /// Inactive workflows only accept manual runs and error-workflow runs.
    pub async fn trigger(
        &self,
        workflow_id: &str,
        mode: ExecutionMode,
        input: Value,
        trigger_node: Option<String>,
    ) -> Result<String> {
        let workflow = self.load_workflow(workflow_id).await?;
        if !workflow.active && !matches!(mode, ExecutionMode::Manual | ExecutionMode::Error) {
            return Err(Error::WorkflowInactive(workflow.id));
        }
        validate_workflow(&workflow, self.executor.registry()).map_err(Error::InvalidWorkflow)?;

        let run = ExecutionRun::new(&workflow, mode, input.clone()).with_trigger_node(trigger_node.clone());
        self.storage.save_run(&run).await?;
        self.queue
            .enqueue(Job {
                execution_id: run.id.clone(),
                workflow_id: workflow.id.clone(),
                mode,
                input_data: input,
                trigger_node,
            })
            .await?;

        info!(execution_id = %run.id, workflow_id = %workflow.id, %mode, "Run triggered");
        Ok(run.id)
    }

    /// Cancel a run. In-flight runs stop at the next dispatch boundary;
    /// pending runs are pulled from the queue and marked cancelled.
    /// Returns false if the run is unknown, already finished, or was
    /// delivered to a worker that never registered it.
    pub async fn cancel(&self, execution_id: &str) -> Result<bool> {
        if self.cancellations.cancel(execution_id) {
            info!(execution_id, "Cancellation requested for in-flight run");
            return Ok(true);
        }

        let Some(mut run) = self.storage.get_run(execution_id).await? else {
            return Ok(false);
        };
        if run.status != ExecutionStatus::Running {
            return Ok(false);
        }

        if !self.queue.remove(execution_id).await? {
            // Delivered but not yet registered by its worker
            for _ in 0..CANCEL_HANDOFF_ATTEMPTS {
                tokio::time::sleep(CANCEL_HANDOFF_INTERVAL).await;
                if self.cancellations.cancel(execution_id) {
                    info!(execution_id, "Cancellation requested for in-flight run");
                    return Ok(true);
                }
            }
            warn!(execution_id, "Run is neither pending nor in flight; not cancelled");
            return Ok(false);
        }
        for node in &mut run.nodes {
            if !node.status.is_terminal() {
                node.status = NodeStatus::Skipped;
            }
        }
        run.finish(ExecutionStatus::Cancelled, Some("Cancelled before execution".to_string()));
        self.storage.save_run(&run).await?;
        self.monitor
            .execution_completed(&run.id, &run.workflow_id, run.status, run.duration_ms());
        Ok(true)
    }

    /// Start the failed run's error workflow, if it has one. Failures here
    /// are logged, never propagated.
    pub async fn trigger_error_workflow(&self, run: &ExecutionRun) -> Option<String> {
        let target = run.workflow.settings.error_workflow.as_deref()?;
        // An error workflow failing must not start another one.
        if run.mode == ExecutionMode::Error || run.status != ExecutionStatus::Error {
            return None;
        }

        let failed_node = run
            .nodes
            .iter()
            .find(|n| n.status == NodeStatus::Error)
            .map(|n| {
                json!({
                    "id": n.node_id,
                    "name": n.node_name,
                    "type": n.node_type,
                    "error": n.error.as_ref().map(|e| e.to_value()),
                })
            });
        let input = json!({
            "execution": {
                "id": run.id,
                "mode": run.mode.as_str(),
                "error": run.error,
            },
            "workflow": {
                "id": run.workflow_id,
                "name": run.workflow_name,
            },
            "failed_node": failed_node,
        });

        match self.trigger(target, ExecutionMode::Error, input, None).await {
            Ok(id) => {
                info!(execution_id = %run.id, error_execution_id = %id, "Error workflow triggered");
                Some(id)
            }
            Err(e) => {
                error!(execution_id = %run.id, error_workflow = target, "Failed to trigger error workflow: {}", e);
                None
            }
        }
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<WorkflowDefinition> {
        self.storage
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| Error::Workflow(format!("Workflow not found: {}", workflow_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use crate::storage::MemoryStorage;
    use crate::workflow::{NodeConnection, WorkflowNode};
    use tokio_util::sync::CancellationToken;

    fn engine() -> (Engine, Arc<InMemoryQueue>) {
        let queue = Arc::new(InMemoryQueue::new());
        let engine = Engine::builder(Arc::new(MemoryStorage::new()), queue.clone()).build();
        (engine, queue)
    }

    fn workflow(id: &str) -> WorkflowDefinition {
        WorkflowDefinition::new(id, id)
            .with_node(WorkflowNode::new("hook", "webhook"))
            .with_node(WorkflowNode::new("shape", "set"))
            .with_connection(NodeConnection::new("hook", "shape"))
    }

    #[tokio::test]
    async fn test_trigger_persists_and_enqueues() {
        let (engine, queue) = engine();
        engine.register_workflow(&workflow("wf")).await.unwrap();

        let id = engine
            .trigger("wf", ExecutionMode::Webhook, json!({"a": 1}), Some("hook".into()))
            .await
            .unwrap();

        let run = engine.storage().get_run(&id).await.unwrap().unwrap();
        assert_eq!(run.status, ExecutionStatus::Running);
        assert_eq!(run.workflow.nodes.len(), 2);

        let delivery = queue.receive(&CancellationToken::new()).await.unwrap();
        assert_eq!(delivery.job.execution_id, id);
        assert_eq!(delivery.job.trigger_node.as_deref(), Some("hook"));
    }

    #[tokio::test]
    async fn test_inactive_workflow_rejects_non_manual() {
        let (engine, _) = engine();
        engine.register_workflow(&workflow("wf")).await.unwrap();
        engine.set_active("wf", false).await.unwrap();

        let err = engine
            .trigger("wf", ExecutionMode::Webhook, json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WorkflowInactive(_)));
        assert!(engine.trigger("wf", ExecutionMode::Manual, json!({}), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_register_rejects_invalid() {
        let (engine, _) = engine();
        let wf = WorkflowDefinition::new("bad", "bad").with_node(WorkflowNode::new("a", "set"));
        assert!(matches!(
            engine.register_workflow(&wf).await,
            Err(Error::InvalidWorkflow(_))
        ));
        assert!(matches!(
            engine.trigger("missing", ExecutionMode::Manual, json!({}), None).await,
            Err(Error::Workflow(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_pending_run() {
        let (engine, queue) = engine();
        engine.register_workflow(&workflow("wf")).await.unwrap();
        let id = engine.trigger("wf", ExecutionMode::Manual, json!({}), None).await.unwrap();

        assert!(engine.cancel(&id).await.unwrap());
        assert_eq!(queue.pending(), 0);
        let run = engine.storage().get_run(&id).await.unwrap().unwrap();
        assert_eq!(run.status, ExecutionStatus::Cancelled);

        assert!(!engine.cancel(&id).await.unwrap());
        assert!(!engine.cancel("unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_delivered_run_waits_for_worker() {
        let (engine, queue) = engine();
        engine.register_workflow(&workflow("wf")).await.unwrap();
        let id = engine.trigger("wf", ExecutionMode::Manual, json!({}), None).await.unwrap();
        let _delivery = queue.receive(&CancellationToken::new()).await.unwrap();

        // Nobody picks the delivery up: the stored run must stay untouched
        assert!(!engine.cancel(&id).await.unwrap());
        let run = engine.storage().get_run(&id).await.unwrap().unwrap();
        assert_eq!(run.status, ExecutionStatus::Running);

        let cancellations = engine.cancellations().clone();
        let worker_id = id.clone();
        let registered = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            cancellations.register(&worker_id)
        });
        assert!(engine.cancel(&id).await.unwrap());
        assert!(registered.await.unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_error_workflow_receives_failure_context() {
        let (engine, queue) = engine();
        let handler = WorkflowDefinition::new("on-error", "on-error")
            .with_node(WorkflowNode::new("start", "manual"));
        engine.register_workflow(&handler).await.unwrap();

        let mut failing = workflow("wf");
        failing.settings.error_workflow = Some("on-error".into());
        let mut run = ExecutionRun::new(&failing, ExecutionMode::Webhook, json!({}));
        run.finish(ExecutionStatus::Error, Some("boom".into()));

        let id = engine.trigger_error_workflow(&run).await.unwrap();
        let error_run = engine.storage().get_run(&id).await.unwrap().unwrap();
        assert_eq!(error_run.mode, ExecutionMode::Error);
        assert_eq!(error_run.input["execution"]["error"], "boom");
        assert_eq!(queue.pending(), 1);

        run.mode = ExecutionMode::Error;
        assert!(engine.trigger_error_workflow(&run).await.is_none());
    }
}

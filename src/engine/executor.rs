//! Graph walker: readiness tracking and FIFO dispatch for one run.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Span};

use super::monitor::Monitor;
use super::node_runner::{error_detail, NodeRunner};
use crate::credentials::CredentialProvider;
use crate::error::{Error, Result};
use crate::expression::ExpressionScope;
use crate::metrics;
use crate::nodes::{NodeContext, NodeRegistry, NodeResult, MAIN_PORT};
use crate::resilience::Resilience;
use crate::storage::{ExecutionRun, ExecutionStatus, NodeErrorDetail, NodeExecutionRecord, NodeStatus};
use crate::workflow::{validate_workflow, WorkflowDefinition};

/// Workflow executor.
#[derive(Clone)]
pub struct Executor {
    runner: NodeRunner,
    monitor: Option<Arc<Monitor>>,
    env: Map<String, Value>,
}

impl Executor {
    pub fn new(registry: Arc<NodeRegistry>, resilience: Resilience) -> Self {
        Self {
            runner: NodeRunner::new(registry, resilience),
            monitor: None,
            env: Map::new(),
        }
    }

    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.runner = self.runner.with_credentials(provider);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Values exposed to expressions as `$env`.
    pub fn with_env(mut self, env: Map<String, Value>) -> Self {
        self.env = env;
        self
    }

    pub fn registry(&self) -> &NodeRegistry {
        self.runner.registry()
    }

    pub fn monitor(&self) -> Option<&Arc<Monitor>> {
        self.monitor.as_ref()
    }

    /// Drive `run` to a terminal status.
    ///
    /// Node failures, timeouts, and cancellation end the run with the
    /// matching status and return `Ok`. `Err` is reserved for runs that
    /// cannot start at all: an invalid snapshot or an unknown trigger.
    #[instrument(
        name = "workflow.execute",
        skip(self, run, cancel),
        fields(
            workflow_id = %run.workflow_id,
            mode = %run.mode,
            execution_id = tracing::field::Empty,
        )
    )]
    pub async fn execute_run(&self, run: &mut ExecutionRun, cancel: &CancellationToken) -> Result<()> {
        Span::current().record("execution_id", run.id.as_str());

        let workflow = run.workflow.clone();
        validate_workflow(&workflow, self.registry()).map_err(Error::InvalidWorkflow)?;
        let trigger = self.find_trigger(&workflow, run.trigger_node.as_deref())?;

        info!(
            "Starting execution {} of workflow '{}' from '{}'",
            run.id, workflow.name, workflow.nodes[trigger].id
        );
        metrics::inc_active_runs();
        let start_time = Instant::now();
        if let Some(monitor) = &self.monitor {
            monitor.execution_started(&run.id, &run.workflow_id, run.mode.as_str());
        }

        let mut walk = Walk::new(&workflow, trigger);
        run.nodes = workflow
            .nodes
            .iter()
            .map(|n| NodeExecutionRecord::new(&n.id, n.display_name(), &n.node_type))
            .collect();
        for idx in walk.unreachable() {
            self.set_status(run, idx, NodeStatus::Skipped, None);
        }

        let mut scope = ExpressionScope::new()
            .with_workflow(json!({
                "id": workflow.id,
                "name": workflow.name,
                "active": workflow.active,
            }))
            .with_execution(json!({
                "id": run.id,
                "mode": run.mode.as_str(),
            }))
            .with_variables(Value::Object(workflow.variables.clone()))
            .with_env(self.env.clone());

        let run_timeout = workflow.settings.timeout_seconds.max(1);
        let run_deadline = start_time + Duration::from_secs(run_timeout);
        let mut halted: Option<(ExecutionStatus, String)> = None;

        while let Some(idx) = walk.queue.pop_front() {
            if cancel.is_cancelled() {
                halted = Some((ExecutionStatus::Cancelled, "Execution cancelled".to_string()));
                walk.queue.push_front(idx);
                break;
            }
            if Instant::now() >= run_deadline {
                halted = Some((ExecutionStatus::Error, Error::RunTimeout(run_timeout).to_string()));
                walk.queue.push_front(idx);
                break;
            }

            let node = &workflow.nodes[idx];
            let (items, inputs) = if idx == trigger {
                let seed = seed_items(&run.input);
                (seed.clone(), BTreeMap::from([(MAIN_PORT.to_string(), seed)]))
            } else {
                walk.collect_inputs(idx)
            };

            self.set_status(run, idx, NodeStatus::Running, None);
            let record = &mut run.nodes[idx];
            record.input = items.clone();
            record.started_at = Some(Utc::now());

            let node_started = Instant::now();
            let metadata = self.registry().metadata(&node.node_type).unwrap_or_default();
            let first_port = metadata.outputs.first().copied().unwrap_or(MAIN_PORT);

            let result = if node.disabled {
                debug!("Node '{}' is disabled, passing input through", node.id);
                Ok(NodeRunResult::Disabled(NodeResult::port(first_port, items)))
            } else {
                let mut base = NodeContext::new(&run.id, &workflow.name).with_cancel(cancel.clone());
                base.workflow_id = workflow.id.clone();
                base.mode = run.mode;
                base.items = items;
                base.inputs = inputs;

                let node_timeout = node
                    .timeout_seconds
                    .unwrap_or(workflow.settings.node_timeout_seconds)
                    .max(1);
                let node_deadline = (node_started + Duration::from_secs(node_timeout)).min(run_deadline);
                let limit = node_deadline.saturating_duration_since(Instant::now());

                info!("Executing node '{}' [{}]", node.id, node.node_type);
                match tokio::time::timeout(limit, self.runner.run(node, base, &scope, Some(node_deadline))).await {
                    Ok(Ok(outcome)) => Ok(NodeRunResult::Completed(outcome)),
                    Ok(Err(failure)) => Err((failure.error, failure.detail)),
                    Err(_) => {
                        let error = if node_deadline >= run_deadline {
                            Error::RunTimeout(run_timeout)
                        } else {
                            Error::NodeTimeout {
                                node_id: node.id.clone(),
                                seconds: node_timeout,
                            }
                        };
                        let detail = error_detail(&error, None, 0, None);
                        Err((error, detail))
                    }
                }
            };

            let elapsed = node_started.elapsed();
            metrics::record_node_duration(elapsed, &node.node_type);

            match result {
                Ok(outcome) => {
                    let (output, status, retry_count, detail) = match outcome {
                        NodeRunResult::Disabled(output) => (output, NodeStatus::Skipped, 0, None),
                        NodeRunResult::Completed(outcome) => {
                            let status = if outcome.error.is_some() {
                                NodeStatus::Error
                            } else {
                                NodeStatus::Success
                            };
                            (outcome.result, status, outcome.retry_count, outcome.error)
                        }
                    };

                    if status == NodeStatus::Success {
                        info!("Node '{}' completed successfully", node.id);
                    }
                    metrics::record_node_execution(&node.node_type, status.as_str());
                    scope.record_output(node.display_name(), ordered_items(&output, metadata.outputs));

                    let record = &mut run.nodes[idx];
                    record.output = output.outputs.clone();
                    record.retry_count = retry_count;
                    record.error = detail.clone();
                    record.finished_at = Some(Utc::now());
                    self.set_status(run, idx, status, detail.as_ref());

                    walk.finish(idx, status, &output);
                    for skipped in walk.settle_downstream(idx) {
                        self.set_status(run, skipped, NodeStatus::Skipped, None);
                    }
                }
                Err((err, detail)) => {
                    error!("Node '{}' failed: {}", node.id, detail.message);
                    metrics::record_node_execution(&node.node_type, NodeStatus::Error.as_str());

                    let record = &mut run.nodes[idx];
                    record.retry_count = detail.retry_count;
                    record.error = Some(detail.clone());
                    record.finished_at = Some(Utc::now());
                    self.set_status(run, idx, NodeStatus::Error, Some(&detail));
                    walk.status[idx] = NodeStatus::Error;

                    halted = Some(match err {
                        Error::Cancelled(_) => (ExecutionStatus::Cancelled, err.to_string()),
                        Error::RunTimeout(_) | Error::NodeTimeout { .. } => {
                            (ExecutionStatus::Error, err.to_string())
                        }
                        _ => (
                            ExecutionStatus::Error,
                            Error::NodeExecution {
                                node_id: node.id.clone(),
                                message: detail.message.clone(),
                            }
                            .to_string(),
                        ),
                    });
                    break;
                }
            }
        }

        for idx in walk.unfinished() {
            self.set_status(run, idx, NodeStatus::Skipped, None);
        }

        match halted {
            Some((status, message)) => run.finish(status, Some(message)),
            None => run.finish(ExecutionStatus::Success, None),
        }

        let duration = start_time.elapsed();
        metrics::dec_active_runs();
        metrics::record_run(run.status.as_str(), run.mode.as_str());
        metrics::record_run_duration(duration, &workflow.name);

        if let Some(monitor) = &self.monitor {
            match (&run.status, &run.error) {
                (ExecutionStatus::Error, Some(error)) => {
                    monitor.execution_failed(&run.id, &run.workflow_id, error)
                }
                _ => monitor.execution_completed(
                    &run.id,
                    &run.workflow_id,
                    run.status,
                    duration.as_millis() as u64,
                ),
            }
        }

        match run.status {
            ExecutionStatus::Success => info!("Execution {} completed in {:?}", run.id, duration),
            status => warn!(
                "Execution {} ended {}: {}",
                run.id,
                status,
                run.error.as_deref().unwrap_or_default()
            ),
        }
        Ok(())
    }

    fn find_trigger(&self, workflow: &WorkflowDefinition, requested: Option<&str>) -> Result<usize> {
        let is_trigger = |node_type: &str| {
            self.registry()
                .metadata(node_type)
                .is_some_and(|m| m.trigger)
        };
        match requested {
            Some(id) => workflow
                .nodes
                .iter()
                .position(|n| n.id == id && is_trigger(&n.node_type))
                .ok_or_else(|| Error::Validation(format!("'{}' is not a trigger node of this workflow", id))),
            None => workflow
                .nodes
                .iter()
                .position(|n| is_trigger(&n.node_type))
                .ok_or_else(|| Error::Validation("missing trigger node".to_string())),
        }
    }

    fn set_status(
        &self,
        run: &mut ExecutionRun,
        idx: usize,
        status: NodeStatus,
        detail: Option<&NodeErrorDetail>,
    ) {
        let record = &mut run.nodes[idx];
        record.status = status;
        if let Some(monitor) = &self.monitor {
            monitor.node_status(
                &run.id,
                &record.node_id,
                &record.node_type,
                status,
                detail.map(|d| d.message.as_str()),
            );
        }
    }
}

enum NodeRunResult {
    Disabled(NodeResult),
    Completed(super::node_runner::NodeOutcome),
}

/// Trigger input: an array is a batch, null is no items, anything else
/// is a single item.
fn seed_items(input: &Value) -> Vec<Value> {
    match input {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Output items in declared port order, then any undeclared ports.
fn ordered_items(result: &NodeResult, declared: &[&str]) -> Vec<Value> {
    let mut items: Vec<Value> = declared
        .iter()
        .flat_map(|port| result.items(port).iter().cloned())
        .collect();
    for (port, port_items) in &result.outputs {
        if !declared.contains(&port.as_str()) {
            items.extend(port_items.iter().cloned());
        }
    }
    items
}

/// Mutable scheduling state over one workflow snapshot.
struct Walk<'a> {
    workflow: &'a WorkflowDefinition,
    status: Vec<NodeStatus>,
    /// Items delivered per connection, indexed like `workflow.connections`
    deliveries: Vec<Vec<Value>>,
    incoming: Vec<Vec<usize>>,
    outgoing: Vec<Vec<usize>>,
    sources: Vec<usize>,
    targets: Vec<usize>,
    queue: VecDeque<usize>,
}

impl<'a> Walk<'a> {
    fn new(workflow: &'a WorkflowDefinition, trigger: usize) -> Self {
        let index: HashMap<&str, usize> = workflow
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let count = workflow.nodes.len();
        let mut incoming = vec![Vec::new(); count];
        let mut outgoing = vec![Vec::new(); count];
        let mut sources = Vec::with_capacity(workflow.connections.len());
        let mut targets = Vec::with_capacity(workflow.connections.len());
        for (c, conn) in workflow.connections.iter().enumerate() {
            // Validation guarantees both endpoints exist
            let source = index.get(conn.source.as_str()).copied().unwrap_or_default();
            let target = index.get(conn.target.as_str()).copied().unwrap_or_default();
            outgoing[source].push(c);
            incoming[target].push(c);
            sources.push(source);
            targets.push(target);
        }

        // Nodes the fired trigger cannot reach never run, including other
        // triggers. Settling them now keeps them out of readiness checks.
        let mut reachable = vec![false; count];
        let mut stack = vec![trigger];
        while let Some(n) = stack.pop() {
            if !std::mem::replace(&mut reachable[n], true) {
                stack.extend(outgoing[n].iter().map(|&c| targets[c]));
            }
        }
        let mut status: Vec<NodeStatus> = reachable
            .iter()
            .map(|&r| if r { NodeStatus::Waiting } else { NodeStatus::Skipped })
            .collect();
        status[trigger] = NodeStatus::Queued;

        Self {
            workflow,
            status,
            deliveries: vec![Vec::new(); workflow.connections.len()],
            incoming,
            outgoing,
            sources,
            targets,
            queue: VecDeque::from([trigger]),
        }
    }

    /// Nodes settled as Skipped before dispatch starts.
    fn unreachable(&self) -> Vec<usize> {
        (0..self.status.len())
            .filter(|&idx| self.status[idx] == NodeStatus::Skipped)
            .collect()
    }

    /// Concatenated items plus per-port items, both in connection order.
    fn collect_inputs(&self, idx: usize) -> (Vec<Value>, BTreeMap<String, Vec<Value>>) {
        let mut items = Vec::new();
        let mut ports: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for &c in &self.incoming[idx] {
            let delivered = &self.deliveries[c];
            items.extend(delivered.iter().cloned());
            ports
                .entry(self.workflow.connections[c].target_input.clone())
                .or_default()
                .extend(delivered.iter().cloned());
        }
        (items, ports)
    }

    fn finish(&mut self, idx: usize, status: NodeStatus, output: &NodeResult) {
        self.status[idx] = status;
        for &c in &self.outgoing[idx] {
            let items = output.items(&self.workflow.connections[c].source_output);
            self.deliveries[c].extend(items.iter().cloned());
        }
    }

    /// Re-check readiness of everything downstream of `idx`. Returns the
    /// nodes that became Skipped; ready nodes are queued.
    fn settle_downstream(&mut self, idx: usize) -> Vec<usize> {
        let mut skipped = Vec::new();
        let mut stack: Vec<usize> = self.outgoing[idx].iter().rev().map(|&c| self.targets[c]).collect();

        while let Some(n) = stack.pop() {
            if self.status[n] != NodeStatus::Waiting {
                continue;
            }
            let upstream_done = self.incoming[n]
                .iter()
                .all(|&c| self.status[self.sources[c]].is_terminal());
            if !upstream_done {
                continue;
            }

            let mut port_fed: BTreeMap<&str, bool> = BTreeMap::new();
            for &c in &self.incoming[n] {
                let fed = port_fed
                    .entry(self.workflow.connections[c].target_input.as_str())
                    .or_insert(false);
                *fed |= !self.deliveries[c].is_empty();
            }

            if port_fed.values().all(|fed| *fed) {
                self.status[n] = NodeStatus::Queued;
                self.queue.push_back(n);
            } else {
                debug!("Skipping node '{}': no input arrived", self.workflow.nodes[n].id);
                self.status[n] = NodeStatus::Skipped;
                skipped.push(n);
                stack.extend(self.outgoing[n].iter().rev().map(|&c| self.targets[c]));
            }
        }
        skipped
    }

    /// Nodes never dispatched; they end Skipped.
    fn unfinished(&mut self) -> Vec<usize> {
        self.queue.clear();
        let mut out = Vec::new();
        for (idx, status) in self.status.iter_mut().enumerate() {
            if matches!(status, NodeStatus::Waiting | NodeStatus::Queued) {
                *status = NodeStatus::Skipped;
                out.push(idx);
            }
        }
        out
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use flowrun::config::Config;
use flowrun::credentials::EnvCredentialProvider;
use flowrun::engine::{Engine, MonitorEvent};
use flowrun::expression::{
    collect_env, resolve_expressions, validate_expression, ExpressionContext, ExpressionScope,
};
use flowrun::metrics::{init_metrics, render_metrics};
use flowrun::nodes::NodeRegistry;
use flowrun::queue::{InMemoryQueue, WorkerPool};
use flowrun::shutdown::ShutdownCoordinator;
use flowrun::storage::{ExecutionMode, ExecutionRun, MemoryStorage, SqliteStorage, Storage};
use flowrun::telemetry::{init_telemetry, shutdown_telemetry, OtelConfig};
use flowrun::workflow::{parse_workflow_file, validate_workflow};

/// How long `run` waits for workers after its execution settled.
const RUN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "flowrun")]
#[command(about = "Workflow execution engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file through the queue and a worker
    Run {
        /// Path to a workflow YAML or JSON file
        file: PathBuf,
        /// JSON input for the trigger node
        #[arg(short, long)]
        input: Option<String>,
        /// Persist to this SQLite database instead of memory
        #[arg(long)]
        db: Option<PathBuf>,
        /// Print the full run record as JSON
        #[arg(long)]
        json: bool,
        /// Print Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
    },
    /// Validate a workflow file
    Validate {
        /// Path to a workflow YAML or JSON file
        file: PathBuf,
    },
    /// Parse an expression template, and evaluate it against an item
    CheckExpression {
        /// Template text, e.g. "{{ $json.total * 2 }}"
        text: String,
        /// JSON item bound to $json
        #[arg(long)]
        item: Option<String>,
    },
    /// List available node types
    Nodes,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let provider = init_telemetry(&OtelConfig::from_env())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run {
            file,
            input,
            db,
            json,
            metrics,
        } => cmd_run(&file, input.as_deref(), db, json, metrics).await,
        Commands::Validate { file } => cmd_validate(&file),
        Commands::CheckExpression { text, item } => cmd_check_expression(&text, item.as_deref()),
        Commands::Nodes => {
            cmd_nodes();
            Ok(())
        }
    };

    shutdown_telemetry(provider);
    result
}

fn parse_json_arg(raw: Option<&str>, what: &str) -> anyhow::Result<Value> {
    match raw {
        Some(text) => serde_json::from_str(text).with_context(|| format!("Invalid JSON {}", what)),
        None => Ok(Value::Null),
    }
}

async fn cmd_run(
    file: &Path,
    input: Option<&str>,
    db: Option<PathBuf>,
    as_json: bool,
    show_metrics: bool,
) -> anyhow::Result<()> {
    if show_metrics {
        init_metrics()?;
    }
    let config = Config::load();
    let workflow = parse_workflow_file(file)?;
    let input = parse_json_arg(input, "input")?;

    let storage: Arc<dyn Storage> = match db.or_else(|| config.storage.database_path.clone()) {
        Some(path) => Arc::new(SqliteStorage::open(&path)?),
        None => Arc::new(MemoryStorage::new()),
    };
    let queue = Arc::new(InMemoryQueue::with_policy(config.queue_policy()));
    let engine = Arc::new(
        Engine::builder(storage, queue)
            .circuit_breaker(config.breaker_config())
            .retry_policy(config.retry_policy())
            .credentials(Arc::new(EnvCredentialProvider))
            .env(collect_env(&config.env.allowlist))
            .build(),
    );

    engine.register_workflow(&workflow).await?;
    let mut events = engine.monitor().subscribe();
    println!("Running workflow '{}'...", workflow.name);
    let execution_id = engine
        .trigger(&workflow.id, ExecutionMode::Manual, input, None)
        .await?;

    let shutdown = ShutdownCoordinator::new();
    shutdown.start_signal_listener();
    let pool = WorkerPool::start(engine.clone(), config.worker.concurrency, shutdown.token());

    let mut cancel_requested = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(MonitorEvent::ExecutionCompleted { execution_id: id, .. })
                | Ok(MonitorEvent::ExecutionFailed { execution_id: id, .. })
                    if id == execution_id => break,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.wait_for_shutdown(), if !cancel_requested => {
                cancel_requested = true;
                eprintln!("Cancelling execution {}...", execution_id);
                engine.cancel(&execution_id).await?;
            }
        }
    }

    // Workers exit once the run in hand is persisted
    shutdown.request_shutdown();
    if !shutdown.drain(pool, RUN_GRACE_PERIOD).await {
        eprintln!("Workers did not stop within {}s", RUN_GRACE_PERIOD.as_secs());
    }

    let Some(run) = engine.storage().get_run(&execution_id).await? else {
        bail!("Execution {} was not persisted", execution_id);
    };
    if as_json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
    }
    if show_metrics {
        println!();
        print!("{}", render_metrics());
    }
    Ok(())
}

fn print_run(run: &ExecutionRun) {
    let summary = run.summary();
    println!();
    println!("Execution ID: {}", run.id);
    println!("Status: {}", run.status);
    if let Some(error) = &run.error {
        println!("Error: {}", error);
    }
    println!("Duration: {}ms", summary.duration_ms);
    println!(
        "Nodes: {} succeeded, {} failed, {} skipped",
        summary.nodes_succeeded, summary.nodes_failed, summary.nodes_skipped
    );
    println!();
    println!("{:<24} {:<12} {:<10} {:>6} {:>8}", "NODE", "TYPE", "STATUS", "ITEMS", "RETRIES");
    println!("{}", "-".repeat(64));
    for node in &run.nodes {
        println!(
            "{:<24} {:<12} {:<10} {:>6} {:>8}",
            node.node_id,
            node.node_type,
            node.status,
            node.output_count(),
            node.retry_count
        );
    }
}

fn cmd_validate(file: &Path) -> anyhow::Result<()> {
    let workflow = parse_workflow_file(file)?;
    let registry = NodeRegistry::new();
    match validate_workflow(&workflow, &registry) {
        Ok(()) => {
            println!("✓ Workflow '{}' is valid", workflow.name);
            println!("  Nodes: {}", workflow.nodes.len());
            println!("  Connections: {}", workflow.connections.len());
            Ok(())
        }
        Err(errors) => {
            println!("✗ Workflow '{}' is invalid:", workflow.name);
            for error in &errors {
                println!("  - {}", error);
            }
            bail!("{} validation error(s)", errors.len())
        }
    }
}

fn cmd_check_expression(text: &str, item: Option<&str>) -> anyhow::Result<()> {
    validate_expression(text)?;
    println!("✓ Expression parses");

    if let Some(raw) = item {
        let item = parse_json_arg(Some(raw), "item")?;
        let scope = ExpressionScope::new().with_execution(json!({"id": "check", "mode": "manual"}));
        let items = [item];
        let ctx = ExpressionContext::new(&scope, &items, 0);
        let value = resolve_expressions(&Value::String(text.to_string()), &ctx)?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

fn cmd_nodes() {
    let registry = NodeRegistry::new();
    println!("{:<12} DESCRIPTION", "TYPE");
    println!("{}", "-".repeat(60));
    for (node_type, description) in registry.descriptions() {
        println!("{:<12} {}", node_type, description);
    }
}

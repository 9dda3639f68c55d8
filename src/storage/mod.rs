//! Storage layer for workflows and executions.
//!
//! The engine and worker only see the [`Storage`] trait; backends are
//! swappable. [`MemoryStorage`] backs tests and one-shot CLI runs,
//! [`SqliteStorage`] keeps history on disk.

mod memory;
mod models;
mod sqlite;

use async_trait::async_trait;

pub use memory::MemoryStorage;
pub use models::*;
pub use sqlite::SqliteStorage;

use crate::error::Result;
use crate::workflow::WorkflowDefinition;

/// Repository for workflow definitions and runs.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert or replace a workflow definition, keyed by id.
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()>;

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>>;

    /// All workflows, sorted by id.
    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>>;

    /// Insert or replace a run together with its node records.
    async fn save_run(&self, run: &ExecutionRun) -> Result<()>;

    async fn get_run(&self, id: &str) -> Result<Option<ExecutionRun>>;

    /// Most recent runs of a workflow first.
    async fn list_runs(&self, workflow_id: &str, limit: usize) -> Result<Vec<ExecutionRun>>;
}

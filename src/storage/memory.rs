//! In-memory storage backend.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::models::ExecutionRun;
use super::Storage;
use crate::error::Result;
use crate::workflow::WorkflowDefinition;

/// Process-local storage. Cheap to create, gone on exit.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
    runs: RwLock<HashMap<String, ExecutionRun>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        self.workflows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        Ok(self
            .workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let mut workflows: Vec<WorkflowDefinition> = self
            .workflows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workflows)
    }

    async fn save_run(&self, run: &ExecutionRun) -> Result<()> {
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<ExecutionRun>> {
        Ok(self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }

    async fn list_runs(&self, workflow_id: &str, limit: usize) -> Result<Vec<ExecutionRun>> {
        let mut runs: Vec<ExecutionRun> = self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ExecutionMode, ExecutionStatus};
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        let wf = WorkflowDefinition::new("wf", "Flow");
        storage.save_workflow(&wf).await.unwrap();
        assert_eq!(storage.get_workflow("wf").await.unwrap().unwrap().name, "Flow");
        assert!(storage.get_workflow("other").await.unwrap().is_none());

        let mut run = ExecutionRun::new(&wf, ExecutionMode::Webhook, json!({"a": 1}));
        storage.save_run(&run).await.unwrap();
        run.finish(ExecutionStatus::Success, None);
        storage.save_run(&run).await.unwrap();

        let loaded = storage.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Success);
        assert_eq!(storage.list_runs("wf", 10).await.unwrap().len(), 1);
        assert!(storage.list_runs("wf", 0).await.unwrap().is_empty());
    }
}

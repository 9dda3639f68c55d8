//! SQLite storage implementation.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tokio::sync::Mutex;

use super::models::*;
use super::Storage;
use crate::error::{Error, Result};
use crate::workflow::WorkflowDefinition;

/// Maximum runs returned by one listing.
const MAX_QUERY_LIMIT: usize = 1000;

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<chrono::DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> Option<chrono::DateTime<Utc>> {
    s.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn from_json<T: serde::de::DeserializeOwned>(column: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_enum<T: std::str::FromStr<Err = String>>(column: usize, text: &str) -> rusqlite::Result<T> {
    text.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, e.into())
    })
}

/// SQLite-based storage.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;

        // Initialize schema synchronously before wrapping in async mutex
        Self::init_schema_sync(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &mut Connection) -> Result<()> {
        // WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                workflow_name TEXT NOT NULL,
                mode TEXT NOT NULL,
                status TEXT NOT NULL,
                workflow_snapshot TEXT NOT NULL,
                input TEXT NOT NULL,
                trigger_node TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                error TEXT
            );

            CREATE TABLE IF NOT EXISTS node_executions (
                execution_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                node_id TEXT NOT NULL,
                node_name TEXT NOT NULL,
                node_type TEXT NOT NULL,
                status TEXT NOT NULL,
                input TEXT NOT NULL,
                output TEXT NOT NULL,
                error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                started_at TEXT,
                finished_at TEXT,
                PRIMARY KEY (execution_id, node_id),
                FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_executions_workflow
                ON executions(workflow_id, started_at);
            "#,
        )?;
        Ok(())
    }

    fn row_to_run(row: &Row<'_>) -> rusqlite::Result<ExecutionRun> {
        Ok(ExecutionRun {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            workflow_name: row.get(2)?,
            mode: parse_enum(3, &row.get::<_, String>(3)?)?,
            status: parse_enum(4, &row.get::<_, String>(4)?)?,
            workflow: from_json(5, &row.get::<_, String>(5)?)?,
            input: serde_json::from_str(&row.get::<_, String>(6)?).unwrap_or(Value::Null),
            trigger_node: row.get(7)?,
            started_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
            finished_at: parse_optional_datetime(row.get(9)?),
            error: row.get(10)?,
            nodes: Vec::new(),
        })
    }

    fn row_to_node(row: &Row<'_>) -> rusqlite::Result<NodeExecutionRecord> {
        let error: Option<String> = row.get(5)?;
        Ok(NodeExecutionRecord {
            node_id: row.get(0)?,
            node_name: row.get(1)?,
            node_type: row.get(2)?,
            status: parse_enum(3, &row.get::<_, String>(3)?)?,
            input: from_json(4, &row.get::<_, String>(4)?)?,
            error: error.map(|e| from_json(5, &e)).transpose()?,
            output: from_json(6, &row.get::<_, String>(6)?)?,
            retry_count: row.get(7)?,
            started_at: parse_optional_datetime(row.get(8)?),
            finished_at: parse_optional_datetime(row.get(9)?),
        })
    }

    fn load_nodes(conn: &Connection, run: &mut ExecutionRun) -> rusqlite::Result<()> {
        let mut stmt = conn.prepare(
            "SELECT node_id, node_name, node_type, status, input, error, output, retry_count, started_at, finished_at
             FROM node_executions WHERE execution_id = ?1 ORDER BY position",
        )?;
        run.nodes = stmt
            .query_map([&run.id], Self::row_to_node)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(())
    }
}

const RUN_COLUMNS: &str = "id, workflow_id, workflow_name, mode, status, workflow_snapshot, input, trigger_node, started_at, finished_at, error";

#[async_trait]
impl Storage for SqliteStorage {
    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<()> {
        let definition = serde_json::to_string(workflow)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO workflows (id, name, definition, active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                active = excluded.active,
                updated_at = excluded.updated_at",
            params![
                workflow.id,
                workflow.name,
                definition,
                workflow.active,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        let conn = self.conn.lock().await;
        let definition: Option<String> = conn
            .query_row("SELECT definition FROM workflows WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        definition
            .map(|d| {
                serde_json::from_str(&d)
                    .map_err(|e| Error::Storage(format!("Corrupt workflow '{}': {}", id, e)))
            })
            .transpose()
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT definition FROM workflows ORDER BY id")?;
        let definitions = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        definitions
            .iter()
            .map(|d| serde_json::from_str(d).map_err(Error::from))
            .collect()
    }

    async fn save_run(&self, run: &ExecutionRun) -> Result<()> {
        let snapshot = serde_json::to_string(&run.workflow)?;
        let input = serde_json::to_string(&run.input)?;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO executions
             (id, workflow_id, workflow_name, mode, status, workflow_snapshot, input, trigger_node, started_at, finished_at, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                finished_at = excluded.finished_at,
                error = excluded.error",
            params![
                run.id,
                run.workflow_id,
                run.workflow_name,
                run.mode.as_str(),
                run.status.as_str(),
                snapshot,
                input,
                run.trigger_node,
                run.started_at.to_rfc3339(),
                run.finished_at.map(|t| t.to_rfc3339()),
                run.error,
            ],
        )?;

        tx.execute("DELETE FROM node_executions WHERE execution_id = ?1", [&run.id])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO node_executions
                 (execution_id, position, node_id, node_name, node_type, status, input, output, error, retry_count, started_at, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for (position, node) in run.nodes.iter().enumerate() {
                insert.execute(params![
                    run.id,
                    position as i64,
                    node.node_id,
                    node.node_name,
                    node.node_type,
                    node.status.as_str(),
                    serde_json::to_string(&node.input)?,
                    serde_json::to_string(&node.output)?,
                    node.error.as_ref().map(serde_json::to_string).transpose()?,
                    node.retry_count,
                    node.started_at.map(|t| t.to_rfc3339()),
                    node.finished_at.map(|t| t.to_rfc3339()),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<ExecutionRun>> {
        let conn = self.conn.lock().await;
        let run = conn
            .query_row(
                &format!("SELECT {} FROM executions WHERE id = ?1", RUN_COLUMNS),
                [id],
                Self::row_to_run,
            )
            .optional()?;

        let Some(mut run) = run else {
            return Ok(None);
        };
        Self::load_nodes(&conn, &mut run)?;
        Ok(Some(run))
    }

    async fn list_runs(&self, workflow_id: &str, limit: usize) -> Result<Vec<ExecutionRun>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM executions WHERE workflow_id = ?1 ORDER BY started_at DESC LIMIT ?2",
            RUN_COLUMNS
        ))?;
        let mut runs = stmt
            .query_map(
                params![workflow_id, limit.min(MAX_QUERY_LIMIT) as i64],
                Self::row_to_run,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for run in &mut runs {
            Self::load_nodes(&conn, run)?;
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowNode;
    use serde_json::json;

    fn sample_run() -> ExecutionRun {
        let wf = WorkflowDefinition::new("wf", "Flow").with_node(WorkflowNode::new("hook", "webhook"));
        let mut run = ExecutionRun::new(&wf, ExecutionMode::Webhook, json!({"order": 7}))
            .with_trigger_node(Some("hook".into()));
        let mut node = NodeExecutionRecord::new("hook", "hook", "webhook");
        node.status = NodeStatus::Error;
        node.input = vec![json!({"order": 7})];
        node.output.insert("main".into(), vec![json!({"order": 7})]);
        node.error = Some(NodeErrorDetail {
            message: "boom".into(),
            category: "network".into(),
            severity: "medium".into(),
            retry_count: 2,
        });
        node.retry_count = 2;
        node.started_at = Some(Utc::now());
        run.nodes.push(node);
        run
    }

    #[tokio::test]
    async fn test_save_and_load_run() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut run = sample_run();
        storage.save_run(&run).await.unwrap();

        run.finish(ExecutionStatus::Error, Some("boom".into()));
        storage.save_run(&run).await.unwrap();

        let loaded = storage.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Error);
        assert_eq!(loaded.mode, ExecutionMode::Webhook);
        assert_eq!(loaded.error.as_deref(), Some("boom"));
        assert_eq!(loaded.trigger_node.as_deref(), Some("hook"));
        assert_eq!(loaded.workflow.nodes.len(), 1);
        assert_eq!(loaded.nodes.len(), 1);
        assert_eq!(loaded.nodes[0].error.as_ref().unwrap().retry_count, 2);
        assert_eq!(loaded.nodes[0].output["main"], vec![json!({"order": 7})]);
        assert!(loaded.finished_at.is_some());

        assert!(storage.get_run("missing").await.unwrap().is_none());
        assert_eq!(storage.list_runs("wf", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_workflows_persist_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("flowrun.db");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            let mut wf = WorkflowDefinition::new("b", "Second");
            wf.active = false;
            storage.save_workflow(&wf).await.unwrap();
            storage.save_workflow(&WorkflowDefinition::new("a", "First")).await.unwrap();
        }

        let storage = SqliteStorage::open(&path).unwrap();
        let ids: Vec<String> = storage
            .list_workflows()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(!storage.get_workflow("b").await.unwrap().unwrap().active);
    }
}

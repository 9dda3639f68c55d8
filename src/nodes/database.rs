//! Database node - execute SQL against SQLite.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use ring::digest;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::types::{Node, NodeContext, NodeMetadata, NodeResult, ParameterSpec};
use crate::error::{Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database node for SQL query execution.
pub struct DatabaseNode;

impl DatabaseNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DatabaseNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct DatabaseConfig {
    /// Only "sqlite" is built in
    #[serde(default = "default_db_type")]
    db_type: String,

    /// Database file path; the credential's `connection_string` wins
    #[serde(default, alias = "connection_string")]
    path: Option<String>,

    /// SQL statement to run
    query: String,

    /// Positional parameters bound to `?`
    #[serde(default)]
    params: Vec<Value>,

    /// "query" emits one item per row, "execute" reports affected rows
    #[serde(default = "default_operation")]
    operation: String,

    /// Maximum rows to return
    #[serde(default = "default_max_rows")]
    max_rows: usize,
}

fn default_db_type() -> String {
    "sqlite".to_string()
}

fn default_operation() -> String {
    "query".to_string()
}

fn default_max_rows() -> usize {
    1000
}

const PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec::required("query", "string", "SQL statement"),
    ParameterSpec::optional("path", "string", "SQLite database file"),
    ParameterSpec::optional("params", "array", "Positional parameters"),
    ParameterSpec::optional("operation", "string", "query | execute"),
    ParameterSpec::optional("max_rows", "number", "Row cap for query"),
];

#[async_trait]
impl Node for DatabaseNode {
    fn node_type(&self) -> &str {
        "database"
    }

    fn description(&self) -> &str {
        "Execute SQL queries on SQLite databases"
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::transform().with_parameters(PARAMETERS)
    }

    fn service_key(&self, params: &Value) -> Option<String> {
        if let Some(path) = params.get("path").and_then(Value::as_str) {
            return Some(format!("database:{}", path));
        }
        // Connection strings may carry passwords; key on a digest instead
        let key = match params.get("connection_string").and_then(Value::as_str) {
            Some(dsn) => {
                let hash = digest::digest(&digest::SHA256, dsn.as_bytes());
                hex::encode(&hash.as_ref()[..8])
            }
            None => "sqlite".to_string(),
        };
        Some(format!("database:{}", key))
    }

    async fn execute(&self, params: &Value, ctx: &NodeContext) -> Result<NodeResult> {
        let config: DatabaseConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Validation(format!("Invalid database config: {}", e)))?;

        if config.db_type != "sqlite" {
            return Err(Error::Validation(format!(
                "Unsupported database type '{}'; only sqlite is available",
                config.db_type
            )));
        }
        if config.operation != "query" && config.operation != "execute" {
            return Err(Error::Validation(format!(
                "Unknown database operation '{}', expected query or execute",
                config.operation
            )));
        }

        let path = ctx
            .credential("connection_string")
            .map(str::to_string)
            .or_else(|| config.path.clone())
            .unwrap_or_else(|| ":memory:".to_string());

        debug!(operation = %config.operation, "Executing database query");

        ctx.check_cancelled()?;
        let items = tokio::task::spawn_blocking(move || run_sqlite(&path, &config))
            .await
            .map_err(|e| Error::Internal(format!("SQLite task failed: {}", e)))??;

        Ok(NodeResult::main(items))
    }
}

fn run_sqlite(path: &str, config: &DatabaseConfig) -> Result<Vec<Value>> {
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    let bound = config.params.iter().map(to_sql_value);

    if config.operation == "execute" {
        let affected = conn.execute(&config.query, rusqlite::params_from_iter(bound))?;
        return Ok(vec![json!({
            "operation": "execute",
            "affected_rows": affected,
            "last_insert_rowid": conn.last_insert_rowid(),
        })]);
    }

    let mut stmt = conn.prepare(&config.query)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(bound))?;

    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        if items.len() >= config.max_rows {
            break;
        }
        let mut obj = Map::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            obj.insert(column.clone(), from_sql_value(row.get_ref(i)?));
        }
        items.push(Value::Object(obj));
    }
    Ok(items)
}

fn to_sql_value(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => SqlValue::Integer(i),
            (None, Some(f)) => SqlValue::Real(f),
            _ => SqlValue::Text(n.to_string()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(node: &DatabaseNode, params: Value) -> Result<NodeResult> {
        node.execute(&params, &NodeContext::new("exec-1", "test")).await
    }

    #[tokio::test]
    async fn test_sqlite_execute_then_query() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db").to_string_lossy().to_string();
        let node = DatabaseNode::new();

        run(&node, json!({
            "path": path,
            "query": "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, score REAL)",
            "operation": "execute"
        }))
        .await
        .unwrap();

        let inserted = run(&node, json!({
            "path": path,
            "query": "INSERT INTO users (name, score) VALUES (?, ?), (?, ?)",
            "params": ["ada", 9.5, "bob", null],
            "operation": "execute"
        }))
        .await
        .unwrap();
        assert_eq!(inserted.items("main")[0]["affected_rows"], 2);

        let rows = run(&node, json!({
            "path": path,
            "query": "SELECT id, name, score FROM users ORDER BY id"
        }))
        .await
        .unwrap();
        let items = rows.items("main");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], json!({"id": 1, "name": "ada", "score": 9.5}));
        assert!(items[1]["score"].is_null());
    }

    #[tokio::test]
    async fn test_max_rows_and_errors() {
        let node = DatabaseNode::new();
        let rows = run(&node, json!({
            "query": "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 50) SELECT x FROM n",
            "max_rows": 10
        }))
        .await
        .unwrap();
        assert_eq!(rows.items("main").len(), 10);

        assert!(matches!(
            run(&node, json!({"query": "SELEC nonsense"})).await,
            Err(Error::Database(_))
        ));
        assert!(matches!(
            run(&node, json!({"db_type": "postgres", "query": "SELECT 1"})).await,
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_service_key() {
        assert_eq!(
            DatabaseNode::new().service_key(&json!({"path": "/data/app.db"})),
            Some("database:/data/app.db".to_string())
        );

        let key = DatabaseNode::new()
            .service_key(&json!({"connection_string": "file:app.db?password=hunter2"}))
            .unwrap();
        assert!(key.starts_with("database:"));
        assert!(!key.contains("hunter2"));
        assert_eq!(key.len(), "database:".len() + 16);
    }
}

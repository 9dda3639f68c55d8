//! Error types for flowrun.
//!
//! Every error carries a stable code so callers (queue consumers, CLIs,
//! dashboards) can branch on it without parsing messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::expression::ExpressionError;
use crate::workflow::ValidationError;

/// Result type alias for flowrun operations.
pub type Result<T> = std::result::Result<T, Error>;

/// flowrun error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Workflow validation failed: {}", join_validation_errors(.0))]
    InvalidWorkflow(Vec<ValidationError>),

    #[error("Workflow '{0}' is inactive")]
    WorkflowInactive(String),

    #[error("Node error: {0}")]
    Node(String),

    #[error("Node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    #[error("Node '{node_id}' timed out after {seconds}s")]
    NodeTimeout { node_id: String, seconds: u64 },

    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Circuit open for service '{service}' (retry after {retry_after_ms}ms)")]
    CircuitOpen { service: String, retry_after_ms: u64 },

    #[error("Expression error: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Run timed out after {0} seconds")]
    RunTimeout(u64),

    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Get the error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Workflow(_) => "WORKFLOW_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::InvalidWorkflow(_) => "INVALID_WORKFLOW",
            Error::WorkflowInactive(_) => "WORKFLOW_INACTIVE",
            Error::Node(_) => "NODE_ERROR",
            Error::NodeExecution { .. } => "NODE_EXECUTION_ERROR",
            Error::NodeTimeout { .. } => "NODE_TIMEOUT",
            Error::HttpStatus { .. } => "HTTP_STATUS_ERROR",
            Error::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Error::Expression(_) => "EXPRESSION_ERROR",
            Error::RunTimeout(_) => "RUN_TIMEOUT",
            Error::Cancelled(_) => "CANCELLED",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Credential(_) => "CREDENTIAL_ERROR",
            Error::Queue(_) => "QUEUE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Get a sanitized error message safe for external consumers.
    ///
    /// Hides file paths, SQL statements, and transport internals.
    pub fn external_message(&self) -> String {
        match self {
            Error::Storage(_) => "A storage error occurred".to_string(),
            Error::Internal(_) => "An internal error occurred".to_string(),
            Error::Database(_) => "A database error occurred".to_string(),
            Error::Io(_) => "An I/O error occurred".to_string(),
            Error::Credential(_) => "A credential could not be resolved".to_string(),
            Error::Http(e) => {
                if let Some(status) = e.status() {
                    format!("HTTP request failed with status {}", status.as_u16())
                } else if e.is_timeout() {
                    "HTTP request timed out".to_string()
                } else if e.is_connect() {
                    "Failed to connect to remote server".to_string()
                } else {
                    "HTTP request failed".to_string()
                }
            }
            Error::Yaml(_) => "Invalid YAML format".to_string(),
            Error::Json(_) => "Invalid JSON format".to_string(),
            other => other.to_string(),
        }
    }

    /// Convert to a JSON error envelope with the sanitized message.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.external_message(),
            }
        })
    }
}

/// Structured error payload attached to failed executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorResponse {
    pub fn from_error(error: &Error) -> Self {
        let retry_after_ms = match error {
            Error::CircuitOpen { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        };
        let node_id = match error {
            Error::NodeExecution { node_id, .. } | Error::NodeTimeout { node_id, .. } => {
                Some(node_id.clone())
            }
            _ => None,
        };
        Self {
            code: error.code().to_string(),
            message: error.external_message(),
            node_id,
            retry_after_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::RunTimeout(10).code(), "RUN_TIMEOUT");
        assert_eq!(
            Error::CircuitOpen {
                service: "http:api.example.com".into(),
                retry_after_ms: 100
            }
            .code(),
            "CIRCUIT_OPEN"
        );
        assert_eq!(Error::WorkflowInactive("wf".into()).code(), "WORKFLOW_INACTIVE");
    }

    #[test]
    fn test_external_message_hides_storage_details() {
        let err = Error::Storage("disk /var/lib/flowrun/db.sqlite is full".into());
        assert!(!err.external_message().contains("/var/lib"));
        assert_eq!(err.to_json()["error"]["code"], "STORAGE_ERROR");
    }

    #[test]
    fn test_error_response_carries_retry_hint() {
        let err = Error::CircuitOpen {
            service: "s3:bucket".into(),
            retry_after_ms: 2500,
        };
        let response = ErrorResponse::from_error(&err);
        assert_eq!(response.retry_after_ms, Some(2500));
        assert!(response.node_id.is_none());
    }
}

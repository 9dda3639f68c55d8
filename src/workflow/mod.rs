//! Workflow definition, parsing, and validation.
//!
//! Workflows are defined in YAML or JSON and consist of:
//! - Nodes: typed steps with raw parameters
//! - Connections: edges between named output and input ports
//! - Settings: timeouts, error workflow, save policy

mod parser;
mod types;
mod validator;

pub use parser::{parse_workflow, parse_workflow_file};
pub use types::*;
pub use validator::{validate_workflow, ValidationError, ValidationErrorKind};

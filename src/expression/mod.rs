//! Expression evaluator for `{{ }}` templates in node parameters.
//!
//! Expressions are tokenized with `logos`, parsed into a restricted AST,
//! and evaluated by a tree-walking interpreter against a read-only
//! [`ExpressionContext`]. Nothing in an expression can write to the
//! context or reach the host: only the `$` bindings and the built-in
//! function table in [`functions`] are visible.

mod ast;
mod context;
pub mod functions;
mod interpreter;
mod lexer;
mod parser;
mod template;
mod value;

use thiserror::Error;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use context::{collect_env, ExpressionContext, ExpressionScope};
pub use interpreter::evaluate;
pub use parser::parse_expression;
pub use template::{contains_expression, resolve_expressions, resolve_string, validate_expression};

/// The closed set of identifiers an expression may reference.
pub const BINDINGS: &[&str] = &[
    "$json",
    "$input",
    "$itemIndex",
    "$node",
    "$workflow",
    "$execution",
    "$vars",
    "$env",
    "$now",
    "$today",
];

/// Member names rejected anywhere in an expression.
pub const FORBIDDEN_MEMBERS: &[&str] = &["constructor", "__proto__", "prototype"];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("forbidden expression: {0}")]
    Forbidden(String),

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("evaluation error: {0}")]
    Evaluation(String),
}

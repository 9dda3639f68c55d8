//! Error classification.
//!
//! Rules look at the error variant first (HTTP status, I/O kind, timeout
//! variants) and fall back to keyword matching on the message, first
//! match wins. Each category maps to a fixed retry policy.

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Database,
    Authentication,
    Authorization,
    Validation,
    Timeout,
    ExternalService,
    ResourceExhaustion,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Database => "database",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ExternalService => "external_service",
            ErrorCategory::ResourceExhaustion => "resource_exhaustion",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    RetryWithBackoff,
    CircuitBreak,
    FailFast,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub is_retryable: bool,
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub recovery_strategy: RecoveryStrategy,
}

impl ErrorClassification {
    /// Default policy for a category.
    pub fn for_category(category: ErrorCategory) -> Self {
        use ErrorCategory::*;
        let (severity, is_retryable, max_retries, backoff_multiplier, recovery_strategy) =
            match category {
                Network => (ErrorSeverity::Medium, true, 3, 2.0, RecoveryStrategy::RetryWithBackoff),
                Database => (ErrorSeverity::High, true, 3, 2.0, RecoveryStrategy::RetryWithBackoff),
                Authentication => (ErrorSeverity::High, false, 0, 1.0, RecoveryStrategy::Manual),
                Authorization => (ErrorSeverity::High, false, 0, 1.0, RecoveryStrategy::Manual),
                Validation => (ErrorSeverity::Low, false, 0, 1.0, RecoveryStrategy::FailFast),
                Timeout => (ErrorSeverity::Medium, true, 3, 1.5, RecoveryStrategy::RetryWithBackoff),
                ExternalService => (ErrorSeverity::Medium, true, 5, 2.0, RecoveryStrategy::CircuitBreak),
                ResourceExhaustion => {
                    (ErrorSeverity::Critical, true, 2, 3.0, RecoveryStrategy::RetryWithBackoff)
                }
                Unknown => (ErrorSeverity::Medium, false, 0, 1.0, RecoveryStrategy::FailFast),
            };
        Self {
            category,
            severity,
            is_retryable,
            max_retries,
            backoff_multiplier,
            recovery_strategy,
        }
    }

    fn terminal(mut self, severity: ErrorSeverity) -> Self {
        self.is_retryable = false;
        self.max_retries = 0;
        self.severity = severity;
        self.recovery_strategy = RecoveryStrategy::FailFast;
        self
    }
}

/// Keyword rules over lower-cased messages, evaluated in order.
const MESSAGE_RULES: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Timeout,
        &["timed out", "timeout", "etimedout", "deadline exceeded"],
    ),
    (
        ErrorCategory::Authentication,
        &[
            "unauthorized",
            "unauthenticated",
            "authentication",
            "invalid credentials",
            "invalid api key",
            "invalid token",
            "401",
        ],
    ),
    (
        ErrorCategory::Authorization,
        &["forbidden", "permission denied", "access denied", "not authorized", "403"],
    ),
    (
        ErrorCategory::ExternalService,
        &[
            "rate limit",
            "too many requests",
            "service unavailable",
            "bad gateway",
            "internal server error",
            "upstream",
            "429",
            "500",
            "502",
            "503",
        ],
    ),
    (
        ErrorCategory::ResourceExhaustion,
        &[
            "out of memory",
            "quota",
            "resource exhausted",
            "no space left",
            "disk full",
            "limit exceeded",
        ],
    ),
    (
        ErrorCategory::Network,
        &[
            "connection refused",
            "connection reset",
            "connection closed",
            "econnrefused",
            "econnreset",
            "enotfound",
            "broken pipe",
            "host unreachable",
            "dns",
            "network",
            "socket",
        ],
    ),
    (
        ErrorCategory::Database,
        &["database is locked", "deadlock", "database", "sqlite", "sql"],
    ),
    (
        ErrorCategory::Validation,
        &[
            "invalid",
            "validation",
            "required",
            "missing",
            "malformed",
            "bad request",
            "not found",
            "unsupported",
            "400",
            "404",
        ],
    ),
];

/// Classify an error into a category and retry policy.
pub fn classify_error(error: &Error) -> ErrorClassification {
    match error {
        Error::RunTimeout(_) => {
            return ErrorClassification::for_category(ErrorCategory::Timeout)
                .terminal(ErrorSeverity::High)
        }
        Error::Cancelled(_) => {
            return ErrorClassification::for_category(ErrorCategory::Unknown)
                .terminal(ErrorSeverity::Low)
        }
        _ => {}
    }
    let category = variant_category(error).unwrap_or_else(|| message_category(&error.to_string()));
    ErrorClassification::for_category(category)
}

fn variant_category(error: &Error) -> Option<ErrorCategory> {
    let category = match error {
        Error::Validation(_)
        | Error::InvalidWorkflow(_)
        | Error::WorkflowInactive(_)
        | Error::Expression(_)
        | Error::Parse(_)
        | Error::Config(_)
        | Error::Yaml(_)
        | Error::Json(_) => ErrorCategory::Validation,
        Error::Credential(_) => ErrorCategory::Authentication,
        Error::NodeTimeout { .. } => ErrorCategory::Timeout,
        Error::CircuitOpen { .. } => ErrorCategory::ExternalService,
        Error::HttpStatus { status, .. } => status_category(*status),
        Error::Http(e) => {
            if e.is_timeout() {
                ErrorCategory::Timeout
            } else if let Some(status) = e.status() {
                status_category(status.as_u16())
            } else if e.is_connect() || e.is_request() {
                ErrorCategory::Network
            } else if e.is_decode() || e.is_body() {
                ErrorCategory::Validation
            } else {
                return None;
            }
        }
        Error::Database(e) => {
            let message = e.to_string().to_lowercase();
            if message.contains("syntax error") || message.contains("no such") {
                ErrorCategory::Validation
            } else {
                ErrorCategory::Database
            }
        }
        Error::Io(e) => {
            use std::io::ErrorKind::*;
            match e.kind() {
                TimedOut => ErrorCategory::Timeout,
                ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
                | AddrNotAvailable | BrokenPipe => ErrorCategory::Network,
                OutOfMemory => ErrorCategory::ResourceExhaustion,
                NotFound | InvalidInput | InvalidData | PermissionDenied => {
                    ErrorCategory::Validation
                }
                _ => return None,
            }
        }
        _ => return None,
    };
    Some(category)
}

fn status_category(status: u16) -> ErrorCategory {
    match status {
        401 => ErrorCategory::Authentication,
        403 => ErrorCategory::Authorization,
        408 => ErrorCategory::Timeout,
        429 => ErrorCategory::ExternalService,
        500..=599 => ErrorCategory::ExternalService,
        400..=499 => ErrorCategory::Validation,
        _ => ErrorCategory::Unknown,
    }
}

fn message_category(message: &str) -> ErrorCategory {
    let lowered = message.to_lowercase();
    MESSAGE_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| keyword_matches(&lowered, k)))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Status-code keywords only match as standalone numbers, so "processed
/// 5000 rows" is not a 500.
fn keyword_matches(message: &str, keyword: &str) -> bool {
    if !keyword.bytes().all(|b| b.is_ascii_digit()) {
        return message.contains(keyword);
    }
    let bytes = message.as_bytes();
    message.match_indices(keyword).any(|(start, _)| {
        let end = start + keyword.len();
        let before = start == 0 || !bytes[start - 1].is_ascii_digit();
        let after = end == bytes.len() || !bytes[end].is_ascii_digit();
        before && after
    })
}

/// Stable identifier for "the same error": category plus the message
/// with digit runs collapsed, hashed.
pub fn fingerprint(error: &Error, category: ErrorCategory) -> String {
    let message = error.to_string().to_lowercase();
    let mut normalized = String::with_capacity(message.len());
    let mut in_digits = false;
    for c in message.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                normalized.push('#');
            }
            in_digits = true;
        } else {
            normalized.push(c);
            in_digits = false;
        }
    }
    let input = format!("{}:{}", category.as_str(), normalized);
    let digest = ring::digest::digest(&ring::digest::SHA256, input.as_bytes());
    hex::encode(&digest.as_ref()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category(error: Error) -> ErrorCategory {
        classify_error(&error).category
    }

    #[test]
    fn test_variant_rules() {
        assert_eq!(
            category(Error::HttpStatus { status: 503, message: "Service Unavailable".into() }),
            ErrorCategory::ExternalService
        );
        assert_eq!(
            category(Error::HttpStatus { status: 401, message: "nope".into() }),
            ErrorCategory::Authentication
        );
        assert_eq!(
            category(Error::HttpStatus { status: 422, message: "bad".into() }),
            ErrorCategory::Validation
        );
        assert_eq!(
            category(Error::NodeTimeout { node_id: "n".into(), seconds: 5 }),
            ErrorCategory::Timeout
        );
        assert_eq!(
            category(Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused))),
            ErrorCategory::Network
        );
    }

    #[test]
    fn test_message_rules() {
        assert_eq!(category(Error::Node("ECONNREFUSED 10.0.0.1:443".into())), ErrorCategory::Network);
        assert_eq!(category(Error::Node("request timed out".into())), ErrorCategory::Timeout);
        assert_eq!(category(Error::Node("Invalid API key".into())), ErrorCategory::Authentication);
        assert_eq!(category(Error::Node("rate limit exceeded".into())), ErrorCategory::ExternalService);
        assert_eq!(category(Error::Node("monthly quota reached".into())), ErrorCategory::ResourceExhaustion);
        assert_eq!(category(Error::Node("field 'to' is required".into())), ErrorCategory::Validation);
        assert_eq!(category(Error::Node("something odd".into())), ErrorCategory::Unknown);
    }

    #[test]
    fn test_status_codes_match_whole_numbers() {
        assert_eq!(category(Error::Node("upstream said 503".into())), ErrorCategory::ExternalService);
        assert_eq!(category(Error::Node("processed 5000 rows".into())), ErrorCategory::Unknown);
    }

    #[test]
    fn test_policies() {
        let network = ErrorClassification::for_category(ErrorCategory::Network);
        assert!(network.is_retryable);
        assert_eq!(network.max_retries, 3);
        assert_eq!(network.backoff_multiplier, 2.0);

        let auth = classify_error(&Error::Credential("missing".into()));
        assert!(!auth.is_retryable);
        assert_eq!(auth.recovery_strategy, RecoveryStrategy::Manual);

        let timeout = classify_error(&Error::RunTimeout(30));
        assert_eq!(timeout.category, ErrorCategory::Timeout);
        assert!(!timeout.is_retryable);

        let expression = classify_error(&Error::Expression(
            crate::expression::ExpressionError::UnknownIdentifier("x".into()),
        ));
        assert!(!expression.is_retryable);

        let open = classify_error(&Error::CircuitOpen { service: "s".into(), retry_after_ms: 10 });
        assert!(open.is_retryable);
        assert_eq!(open.recovery_strategy, RecoveryStrategy::CircuitBreak);
    }

    #[test]
    fn test_fingerprint_ignores_numbers() {
        let a = Error::Node("connection refused after 3 attempts".into());
        let b = Error::Node("connection refused after 17 attempts".into());
        let c = Error::Node("connection reset".into());
        assert_eq!(fingerprint(&a, ErrorCategory::Network), fingerprint(&b, ErrorCategory::Network));
        assert_ne!(fingerprint(&a, ErrorCategory::Network), fingerprint(&c, ErrorCategory::Network));
        assert_eq!(fingerprint(&a, ErrorCategory::Network).len(), 16);
    }
}

//! Error types for the workflow engine

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Failure taxonomy surfaced to logs, persisted rows, and the HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Graph invariants violated; fatal at enqueue time
    Validation,
    /// Block type, schema, or template-resolution failure; non-retryable
    Config,
    /// Handler exceeded its time budget
    Timeout,
    /// Handler returned a runtime error
    Execution,
    /// Cooperative cancellation observed
    Cancelled,
    /// Circuit breaker refused the call
    CircuitOpen,
    /// Gateway write failed on a lifecycle row
    Persistence,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Config => "CONFIG",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Execution => "EXECUTION",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::Persistence => "PERSISTENCE",
        };
        write!(f, "{}", s)
    }
}

/// Error strings matched (case-insensitive substring) by the retry classifier.
/// Handlers surface raw provider messages so these patterns can match.
pub const RECOVERABLE_PATTERNS: &[&str] = &[
    "timeout",
    "network error",
    "connection refused",
    "rate limit",
    "too many requests",
    "nonce too low",
    "replacement transaction underpriced",
    "already known",
    "gas price too low",
    "insufficient funds for gas",
    "connection reset",
    "not found",
    "gateway timeout",
    "unknown transaction",
];

/// Check whether an error message matches a recoverable pattern.
pub fn is_recoverable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RECOVERABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Errors raised by the workflow engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Workflow graph failed validation
    #[error("workflow validation failed: {0}")]
    Validation(String),

    /// Block configuration or schema violation
    #[error("invalid block configuration: {0}")]
    Config(String),

    /// Handler exceeded its per-attempt budget
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Handler raised a runtime failure
    #[error("execution failed: {0}")]
    Execution(String),

    /// Cancellation signal observed
    #[error("execution cancelled")]
    Cancelled,

    /// Circuit breaker refused the call
    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    /// Lifecycle persistence failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Workflow not found
    #[error("workflow {0} not found")]
    WorkflowNotFound(String),

    /// Execution not found
    #[error("execution {0} not found")]
    ExecutionNotFound(String),

    /// Illegal status transition on an execution or node row
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Internal invariant breach
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Map onto the surfaced failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Config(_) => ErrorKind::Config,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            EngineError::Persistence(_) => ErrorKind::Persistence,
            EngineError::Execution(_)
            | EngineError::WorkflowNotFound(_)
            | EngineError::ExecutionNotFound(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::Internal(_) => ErrorKind::Execution,
        }
    }

    /// Whether the node executor may retry after this error.
    ///
    /// Timeouts always qualify; runtime failures qualify when the message
    /// matches a recoverable pattern. Config, validation, cancellation, and
    /// open-circuit failures never retry.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EngineError::Timeout(_) => true,
            EngineError::Execution(msg) => is_recoverable_message(msg),
            _ => false,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<sled::Error> for EngineError {
    fn from(err: sled::Error) -> Self {
        EngineError::Persistence(format!("database error: {}", err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Persistence(format!("row encoding error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_recoverable() {
        let err = EngineError::Timeout(Duration::from_secs(30));
        assert!(err.is_recoverable());
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn classifier_matches_known_patterns() {
        assert!(is_recoverable_message("429 Too Many Requests"));
        assert!(is_recoverable_message("nonce too low: next nonce 42"));
        assert!(is_recoverable_message("Gateway Timeout"));
        assert!(!is_recoverable_message("invalid signature"));
    }

    #[test]
    fn config_errors_never_retry() {
        let err = EngineError::Config("missing field url".to_string());
        assert!(!err.is_recoverable());
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn circuit_open_never_retries() {
        let err = EngineError::CircuitOpen("1328:0xabc".to_string());
        assert!(!err.is_recoverable());
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }

    #[test]
    fn kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::CircuitOpen).unwrap();
        assert_eq!(json, "\"CIRCUIT_OPEN\"");
    }
}

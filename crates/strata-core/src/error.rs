use thiserror::Error;

use crate::types::ErrorKind;

#[derive(Debug, Error)]
pub enum StrataError {
    // Store errors
    #[error("State store unavailable: {0}")]
    StateStore(String),

    #[error("Checkpoint store error: {0}")]
    CheckpointStore(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_ms}ms: {tool}")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    // Fault isolation
    #[error("Circuit open for {class} calls, retry in {remaining_ms}ms")]
    CircuitOpen { class: String, remaining_ms: u64 },

    #[error("Circuit half-open for {class} calls, probe capacity exhausted")]
    CircuitProbeBusy { class: String },

    // Decision source errors
    #[error("Decision source failed: {0}")]
    DecisionSource(String),

    // Graph errors
    #[error("Graph validation failed: {0}")]
    GraphValidation(String),

    // Execution errors
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution rejected: {0}")]
    ExecutionRejected(String),

    #[error("Execution cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Rate limit exceeded for session {session}, retry after {retry_after_ms}ms")]
    RateLimited { session: String, retry_after_ms: u64 },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrataError {
    /// Store failures abort the whole execution; state is not optional.
    pub fn is_store_fatal(&self) -> bool {
        matches!(
            self,
            StrataError::StateStore(_) | StrataError::CheckpointStore(_)
        )
    }

    /// Immediate rejection by a circuit breaker (open or saturated half-open).
    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            StrataError::CircuitOpen { .. } | StrataError::CircuitProbeBusy { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StrataError::ToolTimeout { .. })
    }

    /// Classify a failure for the execution error list.
    ///
    /// `critical` marks failures of entry/terminal nodes.
    pub fn kind(&self, critical: bool) -> ErrorKind {
        if self.is_store_fatal() {
            ErrorKind::StoreFatal
        } else if self.is_circuit_open() {
            ErrorKind::CircuitOpen
        } else if self.is_timeout() {
            ErrorKind::Timeout
        } else if matches!(self, StrataError::DecisionSource(_)) {
            ErrorKind::DecisionSource
        } else if critical {
            ErrorKind::ToolCritical
        } else {
            ErrorKind::ToolNonCritical
        }
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;

use thiserror::Error;

use crate::{models::ScanState, tools::ToolKind};

/// Failures of a single tool invocation.
///
/// Only the configuration-type variants (`InvalidTimeout`, `InvalidTarget`)
/// escape [`crate::executor::ToolRunner::execute`]. The others are folded
/// into a [`crate::models::ToolExecutionResult`] with `success = false`.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("tool not found or not executable: {binary}")]
    ToolNotFound { tool: ToolKind, binary: String },

    #[error("{tool} timed out after {timeout_ms}ms")]
    ExecutionTimeout { tool: ToolKind, timeout_ms: u64 },

    #[error("{tool} cancelled")]
    Cancelled { tool: ToolKind },

    #[error("invalid timeout for {tool}: must be greater than zero")]
    InvalidTimeout { tool: ToolKind },

    #[error("invalid target {target:?}: {reason}")]
    InvalidTarget { target: String, reason: &'static str },

    #[error("failed to spawn {tool}: {reason}")]
    Spawn { tool: ToolKind, reason: String },
}

/// Raised inside a normalizer and always absorbed into an empty finding list.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::DeError),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected output: {0}")]
    Unexpected(String),
}

/// Orchestration-level errors.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("unsupported scan mode: {0}")]
    UnsupportedMode(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("scan {scan_id} already started (state {state})")]
    ScanAlreadyStarted { scan_id: String, state: ScanState },

    #[error("scan {0} not found")]
    ScanNotFound(String),

    #[error("scan {0} cancelled")]
    Cancelled(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("scan task failed: {0}")]
    Task(String),
}

impl From<ExecutionError> for ScanError {
    fn from(err: ExecutionError) -> Self {
        ScanError::Configuration(err.to_string())
    }
}

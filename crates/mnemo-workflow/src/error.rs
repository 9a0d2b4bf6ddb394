//! Workflow Errors

use crate::variable::VariableType;

/// Workflow runtime error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// Workflow configuration is not executable
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),
    /// Node configuration failed to parse
    #[error("Invalid node {node_id}: {reason}")]
    InvalidNode { node_id: String, reason: String },
    /// Variable selector is malformed
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),
    /// Variable does not exist
    #[error("Unknown variable: {0}")]
    UnknownVariable(String),
    /// Write into the immutable sys namespace
    #[error("Namespace is immutable: {0}")]
    ImmutableNamespace(String),
    /// Write value does not inhabit the declared type
    #[error("Type mismatch on {selector}: expected {expected:?}, got {got}")]
    TypeMismatch {
        selector: String,
        expected: VariableType,
        got: serde_json::Value,
    },
    /// Node exceeded its soft timeout
    #[error("Node {0} timed out after {1} seconds")]
    NodeTimeout(String, u64),
    /// Node failed and no error edge was present
    #[error("Node {node_id} failed: {reason}")]
    NodeFailed { node_id: String, reason: String },
    /// Execution was cancelled
    #[error("Workflow canceled: {0}")]
    Canceled(String),
    /// Template rendering failed
    #[error("Template error: {0}")]
    Template(String),
    /// Underlying engine error
    #[error(transparent)]
    Core(#[from] mnemo_core::MemoryError),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Workflow result type
pub type Result<T> = std::result::Result<T, WorkflowError>;

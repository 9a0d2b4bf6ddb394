//! Error Types
//!
//! Every failure crossing a component boundary is a tagged variant, never a
//! free-form string. Retry policy lives with the caller; the variant records
//! the origin.

/// Engine-wide error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// Node not found
    #[error("Node not found: {0}")]
    NotFound(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),
    /// Configuration row missing for the requested id
    #[error("Configuration missing: {0}")]
    ConfigMissing(String),
    /// Caller supplied invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// Embedding provider call failed
    #[error("Embedding failed: {0}")]
    EmbeddingFailed(String),
    /// Chat completion provider call failed
    #[error("LLM call failed: {0}")]
    LlmCallFailed(String),
    /// Structured LLM output did not match the expected schema
    #[error("LLM parse error: {0}")]
    LlmParseError(String),
    /// Turn extraction failed after the stricter-prompt retry
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),
    /// Atomic graph write failed; nothing was persisted
    #[error("Persist failed: {0}")]
    PersistFailed(String),
    /// Optimistic activation update lost the race after all retries
    #[error("Activation update conflict on {0}")]
    ActivationUpdateConflict(String),
    /// Store query exceeded its deadline
    #[error("Query timeout: {0}")]
    QueryTimeout(String),
    /// Low-activation node fusion failed; retried next cycle
    #[error("Fusion failed: {0}")]
    FusionFailed(String),
    /// Redis error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl MemoryError {
    /// Whether a task-level retry is worthwhile for this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MemoryError::EmbeddingFailed(_)
                | MemoryError::LlmCallFailed(_)
                | MemoryError::QueryTimeout(_)
        )
    }
}

/// Engine-wide result type
pub type Result<T> = std::result::Result<T, MemoryError>;

//! # Mnemo Core
//!
//! Long-term memory engine for conversational agents. Dialogue turns are
//! distilled into a labeled property graph (statements, entities,
//! summaries), retrieved through hybrid keyword + dense-vector search with
//! ACT-R activation reranking, and slowly reshaped by an Ebbinghaus-style
//! forgetting cycle.
//!
//! ## Subsystems
//!
//! - **Graph store**: SQLite-backed property graph with FTS5 and HNSW
//!   indexes per node category, scoped by `end_user_id`
//! - **Ingestion**: turn -> chunks -> statements/entities/summaries ->
//!   embeddings -> atomic batch write, with second-layer entity dedup
//! - **Retrieval**: parallel keyword + embedding search, z-score+sigmoid
//!   normalization, two-stage content/activation rerank
//! - **Activation**: pure ACT-R base-level activation, recorded on every
//!   retrieval hit with version-guarded batched writes
//! - **Forgetting**: low-activation node fusion driven by embedding
//!   similarity and LLM-chosen surviving content
//! - **Read orchestration**: classify -> decompose -> retrieve -> summarize,
//!   with short-term memory caching
//! - **Task queue**: durable per-user FIFO job execution
//! - **Periodic jobs**: reflection, forgetting, insight regeneration, health
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mnemo_core::{GraphStore, IngestionPipeline, IngestRequest, MemoryConfig};
//!
//! let store = Arc::new(GraphStore::new(None)?);
//! let pipeline = IngestionPipeline::new(store.clone(), provider);
//! let report = pipeline.ingest(&request, &MemoryConfig::default()).await?;
//! ```

// ============================================================================
// MODULES
// ============================================================================

pub mod activation;
pub mod config;
pub mod error;
pub mod forgetting;
pub mod graph;
pub mod health;
pub mod ingestion;
pub mod insight;
pub mod jobs;
pub mod logging;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod redis_support;
pub mod retrieval;
pub mod store;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use config::{MemoryConfig, Settings};
pub use error::{MemoryError, Result};

pub use graph::{
    Chunk, Dialogue, EdgeKind, ExtractedEntity, GraphCounts, GraphEdge, GraphStore, IngestBatch,
    MemorySummary, NodeCategory, NodeHit, Statement, StmtType, TemporalInfo, TemporalRange,
};

pub use activation::{base_level_activation, memory_strength, AccessHistoryManager};

pub use forgetting::{
    cosine_similarity, ebbinghaus_weight, ForgettingConfig, ForgettingEngine, ForgettingReport,
};

pub use provider::{
    chat_structured, ChatMessage, ChatOptions, ChatOutcome, ChatRole, HttpProvider, LanguageModel,
    ProviderKind, TokenUsage, ToolCall, ToolCallFunction, ToolSpec,
};

pub use ingestion::{
    IngestReport, IngestRequest, IngestionPipeline, StorageType, TurnMessage,
};

pub use retrieval::{
    deduplicate_hits, normalize_scores, rerank_with_activation, CombinedSummary, HybridRetriever,
    LatencyMetrics, RankedItem, SearchRequest, SearchResponse, SearchType,
};

pub use orchestrator::{
    MessageIntent, ReadOrchestrator, ReadRequest, ReadResult, SearchSwitch, INSUFFICIENT_EVIDENCE,
};

pub use insight::{InsightService, MemoryAggregates, RegenerationReport, UserSummary};

pub use jobs::{JobRunner, JobSchedule};

pub use queue::handlers::EngineTaskHandler;
pub use queue::{TaskHandler, TaskQueue};

pub use store::{
    EndUserRecord, RelationalStore, ShortTermMemoryRecord, TaskRecord, WorkflowExecutionRecord,
};

pub use health::{HealthReport, HealthStatus, PoolUsage};

pub use redis_support::RedisHandle;

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        GraphStore, HybridRetriever, IngestRequest, IngestionPipeline, LanguageModel,
        MemoryConfig, MemoryError, NodeCategory, ReadOrchestrator, ReadRequest, RelationalStore,
        Result, SearchRequest, SearchType, TaskQueue,
    };
}

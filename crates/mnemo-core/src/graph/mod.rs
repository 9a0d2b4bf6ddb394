//! Labeled Property Graph
//!
//! Node and edge types for the memory graph, plus the SQLite-backed store
//! that exposes typed operations over them (full-text, vector, and temporal
//! indexes per category).

mod migrations;
mod store;
mod types;
#[cfg(feature = "vector-search")]
mod vector;

pub use store::{
    sanitize_fts_query, ActivationRow, ActivationWrite, DedupCandidate, GraphCounts, GraphStore,
    MergeOutcome,
};
pub use types::{
    Chunk, Dialogue, EdgeKind, ExtractedEntity, GraphEdge, IngestBatch, MemorySummary,
    NodeCategory, NodeHit, Statement, StmtType, TemporalInfo, TemporalRange,
};
#[cfg(feature = "vector-search")]
pub use vector::{CategoryVectorIndex, VectorIndexStats};

/// Apply the shared schema to a connection owned by another layer
pub(crate) fn migrations_for_store(conn: &rusqlite::Connection) -> crate::error::Result<()> {
    migrations::apply_migrations(conn)
}

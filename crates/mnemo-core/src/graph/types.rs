//! Graph Node and Edge Types
//!
//! Five node labels form two layers: Dialogue/Chunk carry raw conversation
//! text, Statement/ExtractedEntity/MemorySummary carry distilled knowledge.
//! Only the knowledge layer participates in activation tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CATEGORIES
// ============================================================================

/// Node label in the property graph
///
/// Serializes with the plural result-map keys used on the search surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NodeCategory {
    /// Raw conversational turn as received
    #[serde(rename = "dialogues")]
    Dialogue,
    /// Addressable unit of a Dialogue after segmentation
    #[serde(rename = "chunks")]
    Chunk,
    /// Atomic factual/opinion/prediction clause
    #[serde(rename = "statements")]
    Statement,
    /// Named entity mentioned across statements
    #[serde(rename = "entities")]
    Entity,
    /// LLM-written summary of a group of statements
    #[serde(rename = "summaries")]
    Summary,
}

impl NodeCategory {
    /// Categories included in retrieval by default
    pub const SEARCHABLE: [NodeCategory; 4] = [
        NodeCategory::Statement,
        NodeCategory::Chunk,
        NodeCategory::Entity,
        NodeCategory::Summary,
    ];

    /// Categories that carry activation state (the knowledge layer)
    pub const KNOWLEDGE: [NodeCategory; 3] = [
        NodeCategory::Statement,
        NodeCategory::Entity,
        NodeCategory::Summary,
    ];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeCategory::Dialogue => "dialogue",
            NodeCategory::Chunk => "chunk",
            NodeCategory::Statement => "statement",
            NodeCategory::Entity => "entity",
            NodeCategory::Summary => "summary",
        }
    }

    /// Plural key used in per-category result maps
    pub fn result_key(&self) -> &'static str {
        match self {
            NodeCategory::Dialogue => "dialogues",
            NodeCategory::Chunk => "chunks",
            NodeCategory::Statement => "statements",
            NodeCategory::Entity => "entities",
            NodeCategory::Summary => "summaries",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "dialogue" | "dialogues" => Some(NodeCategory::Dialogue),
            "chunk" | "chunks" => Some(NodeCategory::Chunk),
            "statement" | "statements" => Some(NodeCategory::Statement),
            "entity" | "entities" => Some(NodeCategory::Entity),
            "summary" | "summaries" => Some(NodeCategory::Summary),
            _ => None,
        }
    }

    /// Whether nodes of this category carry activation state
    pub fn is_knowledge(&self) -> bool {
        Self::KNOWLEDGE.contains(self)
    }

    /// Backing table name
    pub(crate) fn table(&self) -> &'static str {
        match self {
            NodeCategory::Dialogue => "dialogues",
            NodeCategory::Chunk => "chunks",
            NodeCategory::Statement => "statements",
            NodeCategory::Entity => "entities",
            NodeCategory::Summary => "summaries",
        }
    }

    /// FTS5 shadow table name, when the category is searchable by keyword
    pub(crate) fn fts_table(&self) -> Option<&'static str> {
        match self {
            NodeCategory::Dialogue => None,
            NodeCategory::Chunk => Some("chunks_fts"),
            NodeCategory::Statement => Some("statements_fts"),
            NodeCategory::Entity => Some("entities_fts"),
            NodeCategory::Summary => Some("summaries_fts"),
        }
    }

    /// Column holding the node's primary text
    pub(crate) fn content_column(&self) -> &'static str {
        match self {
            NodeCategory::Dialogue => "content",
            NodeCategory::Chunk => "content",
            NodeCategory::Statement => "statement",
            NodeCategory::Entity => "name",
            NodeCategory::Summary => "content",
        }
    }
}

impl std::fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// EDGES
// ============================================================================

/// Relationship kinds; direction matters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    /// Dialogue → Chunk
    HasChunk,
    /// Chunk → Statement
    HasStatement,
    /// Statement → ExtractedEntity
    Mentions,
    /// MemorySummary → Statement
    DerivedFromStatement,
    /// ExtractedEntity → ExtractedEntity (weighted)
    RelatedTo,
}

impl EdgeKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::HasChunk => "HAS_CHUNK",
            EdgeKind::HasStatement => "HAS_STATEMENT",
            EdgeKind::Mentions => "MENTIONS",
            EdgeKind::DerivedFromStatement => "DERIVED_FROM_STATEMENT",
            EdgeKind::RelatedTo => "RELATED_TO",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "HAS_CHUNK" => Some(EdgeKind::HasChunk),
            "HAS_STATEMENT" => Some(EdgeKind::HasStatement),
            "MENTIONS" => Some(EdgeKind::Mentions),
            "DERIVED_FROM_STATEMENT" => Some(EdgeKind::DerivedFromStatement),
            "RELATED_TO" => Some(EdgeKind::RelatedTo),
            _ => None,
        }
    }
}

/// A directed edge in the graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub source_id: String,
    pub target_id: String,
    pub kind: EdgeKind,
    /// Connection weight, used only by RELATED_TO
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl GraphEdge {
    pub fn new(source_id: impl Into<String>, target_id: impl Into<String>, kind: EdgeKind) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            kind,
            weight: None,
        }
    }
}

// ============================================================================
// NODES
// ============================================================================

/// Raw conversational turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dialogue {
    pub id: String,
    pub end_user_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Addressable unit of a Dialogue; equals the turn for short turns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub end_user_id: String,
    pub dialogue_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Statement classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StmtType {
    #[default]
    Fact,
    Opinion,
    Prediction,
}

impl StmtType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StmtType::Fact => "FACT",
            StmtType::Opinion => "OPINION",
            StmtType::Prediction => "PREDICTION",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "OPINION" => StmtType::Opinion,
            "PREDICTION" => StmtType::Prediction,
            _ => StmtType::Fact,
        }
    }
}

/// Temporal character of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemporalInfo {
    /// True once, stays true
    Static,
    /// True now, may change
    Dynamic,
    /// No temporal dimension
    #[default]
    Atemporal,
}

impl TemporalInfo {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemporalInfo::Static => "STATIC",
            TemporalInfo::Dynamic => "DYNAMIC",
            TemporalInfo::Atemporal => "ATEMPORAL",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "STATIC" => TemporalInfo::Static,
            "DYNAMIC" => TemporalInfo::Dynamic,
            _ => TemporalInfo::Atemporal,
        }
    }
}

/// Atomic factual/opinion/prediction clause extracted from a Chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statement {
    pub id: String,
    pub end_user_id: String,
    pub chunk_id: String,
    pub statement: String,
    pub stmt_type: StmtType,
    pub temporal_info: TemporalInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion_intensity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion_subject: Option<String>,
    #[serde(default)]
    pub emotion_keywords: Vec<String>,
    pub importance_score: f64,
    /// ACT-R base-level activation; absent until the node is first accessed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_value: Option<f64>,
    /// Bounded append-only list of UTC access timestamps
    #[serde(default)]
    pub access_history: Vec<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Optimistic concurrency guard for activation writes
    #[serde(default)]
    pub version: i64,
}

/// Named entity with aliases, typed and described
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedEntity {
    pub id: String,
    pub end_user_id: String,
    pub name: String,
    pub entity_type: String,
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub connect_strength: f64,
    pub is_explicit_memory: bool,
    pub importance_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_value: Option<f64>,
    #[serde(default)]
    pub access_history: Vec<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

impl ExtractedEntity {
    /// Case-insensitive name match against the canonical name and all aliases
    pub fn matches_name(&self, candidate: &str) -> bool {
        let folded = candidate.trim().to_lowercase();
        if self.name.trim().to_lowercase() == folded {
            return true;
        }
        self.aliases.iter().any(|a| a.trim().to_lowercase() == folded)
    }
}

/// LLM-written summary of a group of statements for one turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemorySummary {
    pub id: String,
    pub end_user_id: String,
    pub content: String,
    pub importance_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_value: Option<f64>,
    #[serde(default)]
    pub access_history: Vec<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub version: i64,
}

// ============================================================================
// SEARCH & WRITE PAYLOADS
// ============================================================================

/// One search hit with its raw index score and node properties
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHit {
    pub id: String,
    /// Raw index score: bm25-derived for keyword, cosine for embedding
    pub score: f64,
    pub category: NodeCategory,
    /// Node properties; content under the category's text field
    pub props: serde_json::Value,
}

impl NodeHit {
    /// Primary text of the hit, from whichever property carries it
    pub fn content(&self) -> Option<&str> {
        for key in ["text", "content", "statement", "name"] {
            if let Some(value) = self.props.get(key).and_then(|v| v.as_str()) {
                return Some(value);
            }
        }
        None
    }

    /// ACT-R activation, when the node has been accessed before
    pub fn activation_value(&self) -> Option<f64> {
        self.props.get("activationValue").and_then(|v| v.as_f64())
    }

    /// Importance score with the 0.5 default for legacy rows
    pub fn importance_score(&self) -> f64 {
        self.props
            .get("importanceScore")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5)
    }

    /// Creation timestamp, when parseable
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.props
            .get("createdAt")
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Inclusive time window for temporal queries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporalRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    /// Filter statements valid at this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_at: Option<DateTime<Utc>>,
}

/// One turn's worth of graph writes, applied atomically
#[derive(Debug, Clone, Default)]
pub struct IngestBatch {
    pub dialogue: Option<Dialogue>,
    pub chunks: Vec<Chunk>,
    pub statements: Vec<Statement>,
    /// Entities to create; deduped entities are referenced via edges only
    pub entities: Vec<ExtractedEntity>,
    pub summaries: Vec<MemorySummary>,
    pub edges: Vec<GraphEdge>,
    /// Embeddings keyed by node id, with the owning category
    pub embeddings: Vec<(String, NodeCategory, Vec<f32>)>,
}

impl IngestBatch {
    /// Number of nodes this batch will create
    pub fn node_count(&self) -> usize {
        self.dialogue.iter().count()
            + self.chunks.len()
            + self.statements.len()
            + self.entities.len()
            + self.summaries.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Ingestion Pipeline
//!
//! Turns one dialogue turn into graph nodes: segment into chunks, extract
//! statements/entities/a summary per chunk, embed everything in batched
//! calls, dedup entities against the existing scope, persist the whole turn
//! in one atomic batch, then record the creation access for knowledge nodes.
//!
//! One ingestion per `end_user_id` runs at a time (the task queue serializes
//! the lane); turns for different users flow fully in parallel.

pub mod extraction;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activation::AccessHistoryManager;
use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::graph::{
    Chunk, Dialogue, EdgeKind, ExtractedEntity, GraphEdge, GraphStore, IngestBatch, MemorySummary,
    NodeCategory, Statement,
};
use crate::provider::LanguageModel;

use extraction::{extract_chunk, ExtractionResult};

/// A chunk is split off per message once the turn exceeds this length
const SINGLE_CHUNK_MAX_CHARS: usize = 800;

// ============================================================================
// REQUEST / RESULT TYPES
// ============================================================================

/// One message of a turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMessage {
    pub role: String,
    pub content: String,
}

/// Where a turn's memory lands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Full knowledge-graph distillation
    #[default]
    Graph,
    /// Raw chunks with embeddings only, no LLM distillation
    Rag,
}

/// Ingestion request for one turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub end_user_id: String,
    pub messages: Vec<TurnMessage>,
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// What one successful ingestion created
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub dialogue_id: String,
    pub chunks: usize,
    pub statements: usize,
    pub entities_created: usize,
    pub entities_deduped: usize,
    pub summaries: usize,
}

// ============================================================================
// PIPELINE
// ============================================================================

/// The write path: turn -> chunks -> knowledge -> graph
pub struct IngestionPipeline {
    store: Arc<GraphStore>,
    model: Arc<dyn LanguageModel>,
    access: AccessHistoryManager,
}

impl IngestionPipeline {
    pub fn new(store: Arc<GraphStore>, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            access: AccessHistoryManager::new(store.clone()),
            store,
            model,
        }
    }

    /// Ingest one turn
    pub async fn ingest(&self, request: &IngestRequest, config: &MemoryConfig) -> Result<IngestReport> {
        if request.end_user_id.trim().is_empty() {
            return Err(MemoryError::InvalidInput("end_user_id is required".to_string()));
        }
        if request.messages.iter().all(|m| m.content.trim().is_empty()) {
            return Err(MemoryError::InvalidInput("messages are empty".to_string()));
        }

        let now = Utc::now();
        let (dialogue, chunks) = segment_turn(&request.end_user_id, &request.messages, now);

        match request.storage_type {
            StorageType::Graph => self.ingest_graph(request, config, dialogue, chunks, now).await,
            StorageType::Rag => self.ingest_rag(config, dialogue, chunks).await,
        }
    }

    async fn ingest_graph(
        &self,
        request: &IngestRequest,
        config: &MemoryConfig,
        dialogue: Dialogue,
        chunks: Vec<Chunk>,
        now: DateTime<Utc>,
    ) -> Result<IngestReport> {
        // Extract every chunk; a single failed chunk fails the turn
        let mut extractions: Vec<ExtractionResult> = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let extraction = extract_chunk(
                self.model.as_ref(),
                config,
                &chunk.content,
                request.language.as_deref(),
            )
            .await?;
            extractions.push(extraction);
        }

        let mut batch = IngestBatch {
            dialogue: Some(dialogue.clone()),
            ..Default::default()
        };
        let mut report = IngestReport {
            dialogue_id: dialogue.id.clone(),
            ..Default::default()
        };

        for chunk in &chunks {
            batch.edges.push(GraphEdge::new(
                dialogue.id.clone(),
                chunk.id.clone(),
                EdgeKind::HasChunk,
            ));
        }

        let mut statement_texts = Vec::new();
        let mut entity_names = Vec::new();
        let mut summary_texts = Vec::new();
        let mut new_entity_indices: Vec<usize> = Vec::new();

        for (chunk, extraction) in chunks.iter().zip(extractions.iter()) {
            // Statements of this chunk, remembering ids for entity mentions
            let mut chunk_statement_ids = Vec::with_capacity(extraction.statements.len());
            for draft in &extraction.statements {
                let id = Uuid::new_v4().to_string();
                chunk_statement_ids.push(id.clone());
                statement_texts.push(draft.statement.clone());
                batch.statements.push(Statement {
                    id: id.clone(),
                    end_user_id: request.end_user_id.clone(),
                    chunk_id: chunk.id.clone(),
                    statement: draft.statement.clone(),
                    stmt_type: draft.stmt_type(),
                    temporal_info: draft.temporal_info(),
                    valid_at: parse_optional_time(draft.valid_at.as_deref()),
                    invalid_at: parse_optional_time(draft.invalid_at.as_deref()),
                    emotion_type: draft.emotion_type.clone(),
                    emotion_intensity: draft.emotion_intensity,
                    emotion_subject: draft.emotion_subject.clone(),
                    emotion_keywords: draft.emotion_keywords.clone(),
                    importance_score: draft.importance_score.clamp(0.0, 1.0),
                    activation_value: None,
                    access_history: vec![],
                    created_at: now,
                    version: 0,
                });
                batch.edges.push(GraphEdge::new(
                    chunk.id.clone(),
                    id,
                    EdgeKind::HasStatement,
                ));
            }

            // Second-layer entity dedup against the user's existing scope
            for draft in &extraction.entities {
                if draft.name.trim().is_empty() {
                    continue;
                }
                let entity_id = match self.resolve_existing_entity(&request.end_user_id, draft)? {
                    Some(existing_id) => {
                        report.entities_deduped += 1;
                        existing_id
                    }
                    None => {
                        // A batch may mention the same new entity twice
                        let already_queued = batch
                            .entities
                            .iter()
                            .find(|e| e.matches_name(&draft.name))
                            .map(|e| e.id.clone());
                        match already_queued {
                            Some(queued_id) => {
                                report.entities_deduped += 1;
                                queued_id
                            }
                            None => {
                                let id = Uuid::new_v4().to_string();
                                entity_names.push(draft.name.clone());
                                new_entity_indices.push(batch.entities.len());
                                batch.entities.push(ExtractedEntity {
                                    id: id.clone(),
                                    end_user_id: request.end_user_id.clone(),
                                    name: draft.name.trim().to_string(),
                                    entity_type: draft.entity_type.clone(),
                                    description: draft.description.clone(),
                                    aliases: draft.aliases.clone(),
                                    connect_strength: draft.connect_strength.clamp(0.0, 1.0),
                                    is_explicit_memory: draft.is_explicit_memory,
                                    importance_score: 0.5,
                                    activation_value: None,
                                    access_history: vec![],
                                    created_at: now,
                                    version: 0,
                                });
                                id
                            }
                        }
                    }
                };

                for index in &draft.statement_indices {
                    if let Some(statement_id) = chunk_statement_ids.get(*index) {
                        batch.edges.push(GraphEdge::new(
                            statement_id.clone(),
                            entity_id.clone(),
                            EdgeKind::Mentions,
                        ));
                    }
                }
                // An entity with no resolvable mention still links to the
                // chunk's statements contextually via the first statement
                if draft.statement_indices.is_empty() {
                    if let Some(statement_id) = chunk_statement_ids.first() {
                        batch.edges.push(GraphEdge::new(
                            statement_id.clone(),
                            entity_id.clone(),
                            EdgeKind::Mentions,
                        ));
                    }
                }
            }

            // Summary node for the chunk
            if !extraction.summary.trim().is_empty() {
                let summary_id = Uuid::new_v4().to_string();
                summary_texts.push(extraction.summary.clone());
                batch.summaries.push(MemorySummary {
                    id: summary_id.clone(),
                    end_user_id: request.end_user_id.clone(),
                    content: extraction.summary.clone(),
                    importance_score: 0.5,
                    activation_value: None,
                    access_history: vec![],
                    created_at: now,
                    version: 0,
                });
                for statement_id in &chunk_statement_ids {
                    batch.edges.push(GraphEdge::new(
                        summary_id.clone(),
                        statement_id.clone(),
                        EdgeKind::DerivedFromStatement,
                    ));
                }
            }
        }

        batch.chunks = chunks;

        // One batched embedding call per category
        let statement_vectors = self
            .embed_batch(&config.embedding_model_id, &statement_texts)
            .await?;
        for (statement, vector) in batch.statements.iter().zip(statement_vectors) {
            batch
                .embeddings
                .push((statement.id.clone(), NodeCategory::Statement, vector));
        }

        let entity_vectors = self.embed_batch(&config.embedding_model_id, &entity_names).await?;
        for (index, vector) in new_entity_indices.iter().zip(entity_vectors) {
            batch
                .embeddings
                .push((batch.entities[*index].id.clone(), NodeCategory::Entity, vector));
        }

        let summary_vectors = self.embed_batch(&config.embedding_model_id, &summary_texts).await?;
        for (summary, vector) in batch.summaries.iter().zip(summary_vectors) {
            batch
                .embeddings
                .push((summary.id.clone(), NodeCategory::Summary, vector));
        }

        report.chunks = batch.chunks.len();
        report.statements = batch.statements.len();
        report.entities_created = batch.entities.len();
        report.summaries = batch.summaries.len();

        // All-or-nothing persist
        self.store.upsert_ingested_batch(&batch)?;

        // Creation access initialises the activation state
        let statement_ids: Vec<String> = batch.statements.iter().map(|s| s.id.clone()).collect();
        let entity_ids: Vec<String> = batch.entities.iter().map(|e| e.id.clone()).collect();
        let summary_ids: Vec<String> = batch.summaries.iter().map(|s| s.id.clone()).collect();
        for (category, ids) in [
            (NodeCategory::Statement, statement_ids),
            (NodeCategory::Entity, entity_ids),
            (NodeCategory::Summary, summary_ids),
        ] {
            if let Err(e) = self.access.record_batch_access(category, &ids, config, now) {
                tracing::warn!(category = %category, "creation access init failed: {}", e);
            }
        }

        tracing::info!(
            end_user_id = %request.end_user_id,
            dialogue_id = %report.dialogue_id,
            statements = report.statements,
            entities = report.entities_created,
            deduped = report.entities_deduped,
            "turn ingested"
        );

        Ok(report)
    }

    /// RAG storage keeps the raw layer only
    async fn ingest_rag(
        &self,
        config: &MemoryConfig,
        dialogue: Dialogue,
        chunks: Vec<Chunk>,
    ) -> Result<IngestReport> {
        let chunk_texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embed_batch(&config.embedding_model_id, &chunk_texts).await?;

        let mut batch = IngestBatch {
            dialogue: Some(dialogue.clone()),
            ..Default::default()
        };
        for chunk in &chunks {
            batch.edges.push(GraphEdge::new(
                dialogue.id.clone(),
                chunk.id.clone(),
                EdgeKind::HasChunk,
            ));
        }
        for (chunk, vector) in chunks.iter().zip(vectors) {
            batch
                .embeddings
                .push((chunk.id.clone(), NodeCategory::Chunk, vector));
        }
        let report = IngestReport {
            dialogue_id: dialogue.id.clone(),
            chunks: chunks.len(),
            ..Default::default()
        };
        batch.chunks = chunks;

        self.store.upsert_ingested_batch(&batch)?;
        Ok(report)
    }

    /// Find an existing entity this draft refers to, unioning aliases in
    fn resolve_existing_entity(
        &self,
        end_user_id: &str,
        draft: &extraction::EntityDraft,
    ) -> Result<Option<String>> {
        let candidates = self.store.find_entity_candidates(end_user_id, &draft.name)?;
        for candidate in &candidates {
            let matches = candidate.entity.matches_name(&draft.name)
                || draft
                    .aliases
                    .iter()
                    .any(|alias| candidate.entity.matches_name(alias));
            if matches {
                let mut aliases = draft.aliases.clone();
                aliases.push(draft.name.clone());
                self.store.union_entity_aliases(&candidate.entity.id, &aliases)?;
                return Ok(Some(candidate.entity.id.clone()));
            }
        }
        Ok(None)
    }

    async fn embed_batch(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        self.model.embed(model, texts).await
    }
}

// ============================================================================
// SEGMENTATION
// ============================================================================

/// Messages -> one Dialogue and its Chunks
///
/// Short turns become a single chunk equal to the turn; longer turns get one
/// chunk per message.
fn segment_turn(
    end_user_id: &str,
    messages: &[TurnMessage],
    now: DateTime<Utc>,
) -> (Dialogue, Vec<Chunk>) {
    let full_text = messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let dialogue = Dialogue {
        id: Uuid::new_v4().to_string(),
        end_user_id: end_user_id.to_string(),
        content: full_text.clone(),
        created_at: now,
    };

    let chunks = if full_text.chars().count() <= SINGLE_CHUNK_MAX_CHARS {
        vec![Chunk {
            id: Uuid::new_v4().to_string(),
            end_user_id: end_user_id.to_string(),
            dialogue_id: dialogue.id.clone(),
            content: full_text,
            created_at: now,
        }]
    } else {
        messages
            .iter()
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| Chunk {
                id: Uuid::new_v4().to_string(),
                end_user_id: end_user_id.to_string(),
                dialogue_id: dialogue.id.clone(),
                content: format!("{}: {}", m.role, m.content),
                created_at: now,
            })
            .collect()
    };

    (dialogue, chunks)
}

fn parse_optional_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(messages: &[(&str, &str)]) -> Vec<TurnMessage> {
        messages
            .iter()
            .map(|(role, content)| TurnMessage {
                role: role.to_string(),
                content: content.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_short_turn_is_single_chunk() {
        let (dialogue, chunks) = segment_turn(
            "u1",
            &turn(&[("user", "I like tea"), ("assistant", "Noted!")]),
            Utc::now(),
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, dialogue.content);
        assert_eq!(chunks[0].dialogue_id, dialogue.id);
    }

    #[test]
    fn test_long_turn_chunks_per_message() {
        let long = "x".repeat(900);
        let (dialogue, chunks) = segment_turn(
            "u1",
            &turn(&[("user", long.as_str()), ("assistant", "short reply")]),
            Utc::now(),
        );
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.dialogue_id == dialogue.id));
        assert!(chunks[0].content.starts_with("user: "));
        assert!(chunks[1].content.starts_with("assistant: "));
    }

    #[test]
    fn test_parse_optional_time() {
        assert!(parse_optional_time(Some("2026-03-01T10:00:00Z")).is_some());
        assert!(parse_optional_time(Some("not a time")).is_none());
        assert!(parse_optional_time(None).is_none());
    }
}

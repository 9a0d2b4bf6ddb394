//! SQLite Graph Store
//!
//! Typed operations over the labeled property graph: keyword (FTS5/bm25),
//! vector (HNSW), and temporal queries per category, atomic batch ingestion,
//! version-guarded activation updates, and node fusion.
//!
//! Uses separate reader/writer connections behind mutexes so all methods take
//! `&self` and the store is `Send + Sync`; async layers share it as
//! `Arc<GraphStore>`. Category-parallel reads are safe: each query takes the
//! reader lock only for its own duration.

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::graph::types::{
    Chunk, Dialogue, EdgeKind, ExtractedEntity, GraphEdge, IngestBatch, NodeCategory, NodeHit,
    Statement, StmtType, TemporalInfo, TemporalRange,
};

#[cfg(feature = "vector-search")]
use crate::graph::vector::CategoryVectorIndex;

// ============================================================================
// SUPPORT TYPES
// ============================================================================

/// Activation row as read for an optimistic update
#[derive(Debug, Clone)]
pub struct ActivationRow {
    pub id: String,
    pub version: i64,
    pub access_history: Vec<DateTime<Utc>>,
    pub importance_score: f64,
}

/// One conditional activation write
#[derive(Debug, Clone)]
pub struct ActivationWrite {
    pub id: String,
    /// Version observed at read time; the write applies only if it still holds
    pub expected_version: i64,
    pub new_history: Vec<DateTime<Utc>>,
    pub new_activation: Option<f64>,
    pub accessed_at: DateTime<Utc>,
}

/// Candidate row for second-layer entity dedup
#[derive(Debug, Clone)]
pub struct DedupCandidate {
    pub entity: ExtractedEntity,
}

/// Result of a node fusion
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub surviving_id: String,
    pub absorbed_id: String,
    pub edges_moved: usize,
}

/// Per-category node counts for one user scope
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphCounts {
    pub dialogues: i64,
    pub chunks: i64,
    pub statements: i64,
    pub entities: i64,
    pub summaries: i64,
}

impl GraphCounts {
    pub fn total(&self) -> i64 {
        self.dialogues + self.chunks + self.statements + self.entities + self.summaries
    }
}

// ============================================================================
// GRAPH STORE
// ============================================================================

/// SQLite-backed labeled property graph with per-category indexes
pub struct GraphStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    #[cfg(feature = "vector-search")]
    vector_index: Mutex<CategoryVectorIndex>,
}

impl GraphStore {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (or create) the store at the given path
    ///
    /// With `None`, resolves the platform data directory.
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("ai", "mnemo", "core").ok_or_else(|| {
                    MemoryError::Init("Could not determine project directories".to_string())
                })?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("mnemo.db")
            }
        };

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        let store = Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            #[cfg(feature = "vector-search")]
            vector_index: Mutex::new(CategoryVectorIndex::new()),
        };

        #[cfg(feature = "vector-search")]
        store.load_embeddings_into_index()?;

        Ok(store)
    }

    /// Open an in-memory store (tests)
    pub fn in_memory() -> Result<Self> {
        // A shared page cache lets the reader and writer see the same data
        let uri = format!(
            "file:mnemo-{}?mode=memory&cache=shared",
            Uuid::new_v4().simple()
        );
        let writer_conn = Connection::open(&uri)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;
        let reader_conn = Connection::open(&uri)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            #[cfg(feature = "vector-search")]
            vector_index: Mutex::new(CategoryVectorIndex::new()),
        })
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| MemoryError::Init("Writer lock poisoned".into()))
    }

    fn lock_reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| MemoryError::Init("Reader lock poisoned".into()))
    }

    /// Load persisted embeddings into the in-memory HNSW indexes
    #[cfg(feature = "vector-search")]
    fn load_embeddings_into_index(&self) -> Result<()> {
        let rows: Vec<(String, String, Vec<u8>)> = {
            let reader = self.lock_reader()?;
            let mut stmt = reader.prepare("SELECT node_id, category, vector FROM embeddings")?;
            let mapped = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .filter_map(|r| r.ok())
                .collect();
            mapped
        };

        let mut index = self
            .vector_index
            .lock()
            .map_err(|_| MemoryError::Init("Vector index lock poisoned".to_string()))?;
        for (node_id, category, blob) in rows {
            let Some(category) = NodeCategory::parse_name(&category) else {
                continue;
            };
            let vector = vector_from_bytes(&blob);
            if let Err(e) = index.add(category, &node_id, &vector) {
                tracing::warn!("Failed to load embedding for {}: {}", node_id, e);
            }
        }
        Ok(())
    }

    // ========================================================================
    // KEYWORD SEARCH
    // ========================================================================

    /// Full-text search within one category, bm25-ranked, scoped to a user
    pub fn keyword_search(
        &self,
        category: NodeCategory,
        end_user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<NodeHit>> {
        let Some(fts_table) = category.fts_table() else {
            return Ok(vec![]);
        };
        let sanitized = sanitize_fts_query(query);
        if sanitized.is_empty() {
            return Ok(vec![]);
        }

        let table = category.table();
        let sql = format!(
            "SELECT n.id, -bm25({fts}) AS score
             FROM {table} n
             JOIN {fts} f ON n.id = f.id
             WHERE {fts} MATCH ?1
               AND n.end_user_id = ?2
               AND n.is_active = 1
             ORDER BY bm25({fts})
             LIMIT ?3",
            fts = fts_table,
            table = table,
        );

        let scored: Vec<(String, f64)> = {
            let reader = self.lock_reader()?;
            let mut stmt = reader.prepare(&sql)?;
            let mapped = stmt
                .query_map(params![sanitized, end_user_id, limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            mapped
        };

        self.hydrate_hits(category, &scored)
    }

    // ========================================================================
    // EMBEDDING SEARCH
    // ========================================================================

    /// Cosine-similarity search within one category, scoped to a user
    ///
    /// The HNSW index is global per category, so the query over-fetches and
    /// filters to the requested scope afterwards.
    #[cfg(feature = "vector-search")]
    pub fn embedding_search(
        &self,
        category: NodeCategory,
        end_user_id: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<NodeHit>> {
        let raw = {
            let index = self
                .vector_index
                .lock()
                .map_err(|_| MemoryError::Init("Vector index lock poisoned".to_string()))?;
            index.search(category, vector, limit.saturating_mul(4).max(limit))?
        };

        let scored: Vec<(String, f64)> = raw
            .into_iter()
            .map(|(id, score)| (id, score as f64))
            .collect();
        let mut hits = self.hydrate_hits(category, &scored)?;
        // hydrate drops rows outside the scope; enforce the limit afterwards
        hits.retain(|hit| {
            hit.props
                .get("endUserId")
                .and_then(|v| v.as_str())
                .map(|uid| uid == end_user_id)
                .unwrap_or(false)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    /// Fetch the stored embedding for a node
    pub fn get_embedding(&self, node_id: &str) -> Result<Option<Vec<f32>>> {
        let reader = self.lock_reader()?;
        let blob: Option<Vec<u8>> = reader
            .query_row(
                "SELECT vector FROM embeddings WHERE node_id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.map(|b| vector_from_bytes(&b)))
    }

    // ========================================================================
    // TEMPORAL & ID LOOKUPS
    // ========================================================================

    /// Statements filtered by a temporal window
    pub fn temporal_search(
        &self,
        end_user_id: &str,
        range: &TemporalRange,
        limit: usize,
    ) -> Result<Vec<NodeHit>> {
        let mut sql = String::from(
            "SELECT id FROM statements WHERE end_user_id = ?1 AND is_active = 1",
        );
        let mut bindings: Vec<String> = vec![end_user_id.to_string()];

        if let Some(start) = range.start {
            bindings.push(start.to_rfc3339());
            sql.push_str(&format!(" AND created_at >= ?{}", bindings.len()));
        }
        if let Some(end) = range.end {
            bindings.push(end.to_rfc3339());
            sql.push_str(&format!(" AND created_at <= ?{}", bindings.len()));
        }
        if let Some(valid_at) = range.valid_at {
            bindings.push(valid_at.to_rfc3339());
            sql.push_str(&format!(
                " AND (valid_at IS NULL OR valid_at <= ?{n}) AND (invalid_at IS NULL OR invalid_at >= ?{n})",
                n = bindings.len()
            ));
        }
        sql.push_str(&format!(" ORDER BY created_at DESC LIMIT {}", limit as i64));

        let ids: Vec<String> = {
            let reader = self.lock_reader()?;
            let mut stmt = reader.prepare(&sql)?;
            let mapped = stmt
                .query_map(rusqlite::params_from_iter(bindings.iter()), |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            mapped
        };

        let scored: Vec<(String, f64)> = ids.into_iter().map(|id| (id, 0.0)).collect();
        self.hydrate_hits(NodeCategory::Statement, &scored)
    }

    /// Chunk lookup by id within a user scope
    pub fn get_by_chunk_id(&self, end_user_id: &str, chunk_id: &str) -> Result<Option<Chunk>> {
        let reader = self.lock_reader()?;
        let row = reader
            .query_row(
                "SELECT id, end_user_id, dialogue_id, content, created_at FROM chunks
                 WHERE id = ?1 AND end_user_id = ?2 AND is_active = 1",
                params![chunk_id, end_user_id],
                |row| {
                    Ok(Chunk {
                        id: row.get(0)?,
                        end_user_id: row.get(1)?,
                        dialogue_id: row.get(2)?,
                        content: row.get(3)?,
                        created_at: parse_timestamp(&row.get::<_, String>(4)?)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// All chunks of a dialogue, in insertion order
    pub fn get_by_dialogue_id(&self, end_user_id: &str, dialogue_id: &str) -> Result<Vec<Chunk>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, end_user_id, dialogue_id, content, created_at FROM chunks
             WHERE dialogue_id = ?1 AND end_user_id = ?2 AND is_active = 1
             ORDER BY created_at",
        )?;
        let chunks = stmt
            .query_map(params![dialogue_id, end_user_id], |row| {
                Ok(Chunk {
                    id: row.get(0)?,
                    end_user_id: row.get(1)?,
                    dialogue_id: row.get(2)?,
                    content: row.get(3)?,
                    created_at: parse_timestamp(&row.get::<_, String>(4)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(chunks)
    }

    // ========================================================================
    // BATCH INGESTION
    // ========================================================================

    /// Persist one turn's nodes and edges atomically
    ///
    /// Everything lands in a single transaction; on any failure nothing is
    /// written and the error surfaces as `PersistFailed`.
    pub fn upsert_ingested_batch(&self, batch: &IngestBatch) -> Result<()> {
        {
            let mut writer = self.lock_writer()?;
            let tx = writer
                .transaction()
                .map_err(|e| MemoryError::PersistFailed(e.to_string()))?;

            let persist = (|| -> Result<()> {
                if let Some(dialogue) = &batch.dialogue {
                    tx.execute(
                        "INSERT INTO dialogues (id, end_user_id, content, created_at)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            dialogue.id,
                            dialogue.end_user_id,
                            dialogue.content,
                            dialogue.created_at.to_rfc3339()
                        ],
                    )?;
                }

                for chunk in &batch.chunks {
                    tx.execute(
                        "INSERT INTO chunks (id, end_user_id, dialogue_id, content, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            chunk.id,
                            chunk.end_user_id,
                            chunk.dialogue_id,
                            chunk.content,
                            chunk.created_at.to_rfc3339()
                        ],
                    )?;
                }

                for statement in &batch.statements {
                    tx.execute(
                        "INSERT INTO statements (
                            id, end_user_id, chunk_id, statement, stmt_type, temporal_info,
                            valid_at, invalid_at, emotion_type, emotion_intensity,
                            emotion_subject, emotion_keywords, importance_score, created_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                        params![
                            statement.id,
                            statement.end_user_id,
                            statement.chunk_id,
                            statement.statement,
                            statement.stmt_type.as_str(),
                            statement.temporal_info.as_str(),
                            statement.valid_at.map(|t| t.to_rfc3339()),
                            statement.invalid_at.map(|t| t.to_rfc3339()),
                            statement.emotion_type,
                            statement.emotion_intensity,
                            statement.emotion_subject,
                            serde_json::to_string(&statement.emotion_keywords)?,
                            statement.importance_score,
                            statement.created_at.to_rfc3339()
                        ],
                    )?;
                }

                for entity in &batch.entities {
                    tx.execute(
                        "INSERT INTO entities (
                            id, end_user_id, name, name_lower, entity_type, description,
                            aliases, connect_strength, is_explicit_memory, importance_score,
                            created_at
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                        params![
                            entity.id,
                            entity.end_user_id,
                            entity.name,
                            entity.name.trim().to_lowercase(),
                            entity.entity_type,
                            entity.description,
                            serde_json::to_string(&entity.aliases)?,
                            entity.connect_strength,
                            entity.is_explicit_memory as i64,
                            entity.importance_score,
                            entity.created_at.to_rfc3339()
                        ],
                    )?;
                }

                for summary in &batch.summaries {
                    tx.execute(
                        "INSERT INTO summaries (id, end_user_id, content, importance_score, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            summary.id,
                            summary.end_user_id,
                            summary.content,
                            summary.importance_score,
                            summary.created_at.to_rfc3339()
                        ],
                    )?;
                }

                let scope = batch
                    .dialogue
                    .as_ref()
                    .map(|d| d.end_user_id.clone())
                    .or_else(|| batch.statements.first().map(|s| s.end_user_id.clone()))
                    .unwrap_or_default();

                for edge in &batch.edges {
                    tx.execute(
                        "INSERT INTO edges (id, end_user_id, source_id, target_id, kind, weight, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            Uuid::new_v4().to_string(),
                            scope,
                            edge.source_id,
                            edge.target_id,
                            edge.kind.as_str(),
                            edge.weight,
                            Utc::now().to_rfc3339()
                        ],
                    )?;
                }

                for (node_id, category, vector) in &batch.embeddings {
                    tx.execute(
                        "INSERT OR REPLACE INTO embeddings (node_id, category, vector, dimensions, model, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            node_id,
                            category.as_str(),
                            vector_to_bytes(vector),
                            vector.len() as i64,
                            "",
                            Utc::now().to_rfc3339()
                        ],
                    )?;
                }

                Ok(())
            })();

            match persist {
                Ok(()) => tx
                    .commit()
                    .map_err(|e| MemoryError::PersistFailed(e.to_string()))?,
                Err(e) => {
                    // Dropping the transaction rolls it back
                    return Err(MemoryError::PersistFailed(e.to_string()));
                }
            }
        }

        #[cfg(feature = "vector-search")]
        {
            let mut index = self
                .vector_index
                .lock()
                .map_err(|_| MemoryError::Init("Vector index lock poisoned".to_string()))?;
            for (node_id, category, vector) in &batch.embeddings {
                if let Err(e) = index.add(*category, node_id, vector) {
                    tracing::warn!("Failed to index embedding for {}: {}", node_id, e);
                }
            }
        }

        Ok(())
    }

    // ========================================================================
    // ACTIVATION STATE
    // ========================================================================

    /// Read activation rows for a set of nodes (knowledge categories only)
    pub fn fetch_activation_rows(
        &self,
        category: NodeCategory,
        ids: &[String],
    ) -> Result<Vec<ActivationRow>> {
        if !category.is_knowledge() {
            return Err(MemoryError::InvalidInput(format!(
                "category {} does not carry activation state",
                category
            )));
        }
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let table = category.table();
        let placeholders = (1..=ids.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, version, access_history, importance_score FROM {table}
             WHERE id IN ({placeholders}) AND is_active = 1",
        );

        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(id, version, history_json, importance_score)| ActivationRow {
                id,
                version,
                access_history: history_from_json(&history_json),
                importance_score,
            })
            .collect())
    }

    /// Apply conditional activation writes in one batch
    ///
    /// Each write succeeds only when the node's `version` still matches the
    /// read value. Returns ids whose write was applied; the rest lost the
    /// race and should be retried by the caller.
    pub fn batch_update_activation(
        &self,
        category: NodeCategory,
        writes: &[ActivationWrite],
    ) -> Result<Vec<String>> {
        if !category.is_knowledge() {
            return Err(MemoryError::InvalidInput(format!(
                "category {} does not carry activation state",
                category
            )));
        }
        if writes.is_empty() {
            return Ok(vec![]);
        }

        let table = category.table();
        let sql = format!(
            "UPDATE {table} SET
                activation_value = ?1,
                access_history = ?2,
                access_count = access_count + 1,
                last_access_time = ?3,
                version = version + 1
             WHERE id = ?4 AND version = ?5 AND is_active = 1",
        );

        let mut writer = self.lock_writer()?;
        let tx = writer.transaction()?;
        let mut applied = Vec::with_capacity(writes.len());
        {
            let mut stmt = tx.prepare(&sql)?;
            for write in writes {
                let changed = stmt.execute(params![
                    write.new_activation,
                    history_to_json(&write.new_history)?,
                    write.accessed_at.to_rfc3339(),
                    write.id,
                    write.expected_version,
                ])?;
                if changed > 0 {
                    applied.push(write.id.clone());
                }
            }
        }
        tx.commit()?;
        Ok(applied)
    }

    /// Knowledge nodes below an activation threshold (fusion candidates)
    pub fn low_activation_nodes(
        &self,
        category: NodeCategory,
        end_user_id: Option<&str>,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<NodeHit>> {
        let table = category.table();
        let ids: Vec<String> = {
            let reader = self.lock_reader()?;
            match end_user_id {
                Some(user) => {
                    let sql = format!(
                        "SELECT id FROM {table}
                         WHERE activation_value IS NOT NULL AND activation_value < ?1
                           AND end_user_id = ?2 AND is_active = 1
                         ORDER BY activation_value LIMIT ?3",
                    );
                    let mut stmt = reader.prepare(&sql)?;
                    let mapped = stmt
                        .query_map(params![threshold, user, limit as i64], |row| row.get(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    mapped
                }
                None => {
                    let sql = format!(
                        "SELECT id FROM {table}
                         WHERE activation_value IS NOT NULL AND activation_value < ?1
                           AND is_active = 1
                         ORDER BY activation_value LIMIT ?2",
                    );
                    let mut stmt = reader.prepare(&sql)?;
                    let mapped = stmt
                        .query_map(params![threshold, limit as i64], |row| row.get(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    mapped
                }
            }
        };

        let scored: Vec<(String, f64)> = ids.into_iter().map(|id| (id, 0.0)).collect();
        self.hydrate_hits(category, &scored)
    }

    // ========================================================================
    // ENTITY DEDUP & FUSION
    // ========================================================================

    /// Candidate entities for dedup, by full-text name lookup within scope
    pub fn find_entity_candidates(
        &self,
        end_user_id: &str,
        name: &str,
    ) -> Result<Vec<DedupCandidate>> {
        let sanitized = sanitize_fts_query(name);
        if sanitized.is_empty() {
            return Ok(vec![]);
        }

        let ids: Vec<String> = {
            let reader = self.lock_reader()?;
            let mut stmt = reader.prepare(
                "SELECT n.id FROM entities n
                 JOIN entities_fts f ON n.id = f.id
                 WHERE entities_fts MATCH ?1 AND n.end_user_id = ?2 AND n.is_active = 1
                 LIMIT 20",
            )?;
            let mapped = stmt
                .query_map(params![sanitized, end_user_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            mapped
        };

        let mut candidates = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entity) = self.get_entity(&id)? {
                candidates.push(DedupCandidate { entity });
            }
        }
        Ok(candidates)
    }

    /// Entity lookup by id
    pub fn get_entity(&self, id: &str) -> Result<Option<ExtractedEntity>> {
        let reader = self.lock_reader()?;
        let row = reader
            .query_row(
                "SELECT id, end_user_id, name, entity_type, description, aliases,
                        connect_strength, is_explicit_memory, importance_score,
                        activation_value, access_history, created_at, version
                 FROM entities WHERE id = ?1 AND is_active = 1",
                params![id],
                |row| {
                    Ok(ExtractedEntity {
                        id: row.get(0)?,
                        end_user_id: row.get(1)?,
                        name: row.get(2)?,
                        entity_type: row.get(3)?,
                        description: row.get(4)?,
                        aliases: serde_json::from_str(&row.get::<_, String>(5)?)
                            .unwrap_or_default(),
                        connect_strength: row.get(6)?,
                        is_explicit_memory: row.get::<_, i64>(7)? != 0,
                        importance_score: row.get(8)?,
                        activation_value: row.get(9)?,
                        access_history: history_from_json(&row.get::<_, String>(10)?),
                        created_at: parse_timestamp(&row.get::<_, String>(11)?)?,
                        version: row.get(12)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Union an absorbed entity's aliases into a surviving one
    pub fn union_entity_aliases(&self, entity_id: &str, extra: &[String]) -> Result<()> {
        let Some(entity) = self.get_entity(entity_id)? else {
            return Err(MemoryError::NotFound(entity_id.to_string()));
        };
        let mut aliases = entity.aliases.clone();
        for alias in extra {
            if !entity.matches_name(alias) && !aliases.iter().any(|a| a.eq_ignore_ascii_case(alias))
            {
                aliases.push(alias.clone());
            }
        }
        let writer = self.lock_writer()?;
        writer.execute(
            "UPDATE entities SET aliases = ?1, version = version + 1 WHERE id = ?2",
            params![serde_json::to_string(&aliases)?, entity_id],
        )?;
        Ok(())
    }

    /// Fuse two entities: the survivor inherits all edges, the alias union,
    /// the merged access history (deduplicated, capped), and the max
    /// activation. The absorbed node is soft-deleted.
    pub fn merge_entities(
        &self,
        surviving_id: &str,
        absorbed_id: &str,
        history_cap: usize,
    ) -> Result<MergeOutcome> {
        let surviving = self
            .get_entity(surviving_id)?
            .ok_or_else(|| MemoryError::NotFound(surviving_id.to_string()))?;
        let absorbed = self
            .get_entity(absorbed_id)?
            .ok_or_else(|| MemoryError::NotFound(absorbed_id.to_string()))?;

        let mut aliases = surviving.aliases.clone();
        for alias in absorbed.aliases.iter().chain(std::iter::once(&absorbed.name)) {
            if !surviving.matches_name(alias)
                && !aliases.iter().any(|a| a.eq_ignore_ascii_case(alias))
            {
                aliases.push(alias.clone());
            }
        }

        let merged_history = merge_histories(
            &surviving.access_history,
            &absorbed.access_history,
            history_cap,
        );
        let merged_activation = match (surviving.activation_value, absorbed.activation_value) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let mut writer = self.lock_writer()?;
        let tx = writer.transaction()?;

        let moved_out = tx.execute(
            "UPDATE edges SET source_id = ?1 WHERE source_id = ?2",
            params![surviving_id, absorbed_id],
        )?;
        let moved_in = tx.execute(
            "UPDATE edges SET target_id = ?1 WHERE target_id = ?2",
            params![surviving_id, absorbed_id],
        )?;

        tx.execute(
            "UPDATE entities SET
                aliases = ?1,
                access_history = ?2,
                activation_value = ?3,
                version = version + 1
             WHERE id = ?4",
            params![
                serde_json::to_string(&aliases)?,
                history_to_json(&merged_history)?,
                merged_activation,
                surviving_id
            ],
        )?;
        tx.execute(
            "UPDATE entities SET is_active = 0, name_lower = name_lower || ':merged:' || id, version = version + 1 WHERE id = ?1",
            params![absorbed_id],
        )?;

        tx.commit()?;

        #[cfg(feature = "vector-search")]
        {
            let mut index = self
                .vector_index
                .lock()
                .map_err(|_| MemoryError::Init("Vector index lock poisoned".to_string()))?;
            let _ = index.remove(NodeCategory::Entity, absorbed_id);
        }

        Ok(MergeOutcome {
            surviving_id: surviving_id.to_string(),
            absorbed_id: absorbed_id.to_string(),
            edges_moved: moved_out + moved_in,
        })
    }

    /// Fuse two statements: the survivor takes the fused content, inherits
    /// edges and merged history; the absorbed one is soft-deleted.
    pub fn merge_statements(
        &self,
        surviving_id: &str,
        absorbed_id: &str,
        fused_content: &str,
        history_cap: usize,
    ) -> Result<MergeOutcome> {
        let rows = self.fetch_activation_rows(
            NodeCategory::Statement,
            &[surviving_id.to_string(), absorbed_id.to_string()],
        )?;
        let surviving = rows
            .iter()
            .find(|r| r.id == surviving_id)
            .ok_or_else(|| MemoryError::NotFound(surviving_id.to_string()))?;
        let absorbed = rows
            .iter()
            .find(|r| r.id == absorbed_id)
            .ok_or_else(|| MemoryError::NotFound(absorbed_id.to_string()))?;

        let merged_history = merge_histories(
            &surviving.access_history,
            &absorbed.access_history,
            history_cap,
        );

        let mut writer = self.lock_writer()?;
        let tx = writer.transaction()?;

        let moved_out = tx.execute(
            "UPDATE edges SET source_id = ?1 WHERE source_id = ?2",
            params![surviving_id, absorbed_id],
        )?;
        let moved_in = tx.execute(
            "UPDATE edges SET target_id = ?1 WHERE target_id = ?2",
            params![surviving_id, absorbed_id],
        )?;

        tx.execute(
            "UPDATE statements SET
                statement = ?1,
                access_history = ?2,
                version = version + 1
             WHERE id = ?3",
            params![fused_content, history_to_json(&merged_history)?, surviving_id],
        )?;
        tx.execute(
            "UPDATE statements SET is_active = 0, version = version + 1 WHERE id = ?1",
            params![absorbed_id],
        )?;

        tx.commit()?;

        #[cfg(feature = "vector-search")]
        {
            let mut index = self
                .vector_index
                .lock()
                .map_err(|_| MemoryError::Init("Vector index lock poisoned".to_string()))?;
            let _ = index.remove(NodeCategory::Statement, absorbed_id);
        }

        Ok(MergeOutcome {
            surviving_id: surviving_id.to_string(),
            absorbed_id: absorbed_id.to_string(),
            edges_moved: moved_out + moved_in,
        })
    }

    /// Soft-delete one node; retrieval ignores inactive rows
    pub fn soft_delete(&self, category: NodeCategory, id: &str) -> Result<bool> {
        let table = category.table();
        let sql = match category {
            NodeCategory::Entity => format!(
                "UPDATE {table} SET is_active = 0, name_lower = name_lower || ':deleted:' || id WHERE id = ?1"
            ),
            _ => format!("UPDATE {table} SET is_active = 0 WHERE id = ?1"),
        };
        let writer = self.lock_writer()?;
        let changed = writer.execute(&sql, params![id])?;
        Ok(changed > 0)
    }

    // ========================================================================
    // AGGREGATES
    // ========================================================================

    /// Per-category active node counts for one user
    pub fn count_nodes(&self, end_user_id: &str) -> Result<GraphCounts> {
        let reader = self.lock_reader()?;
        let count = |table: &str| -> Result<i64> {
            let sql = format!(
                "SELECT COUNT(*) FROM {table} WHERE end_user_id = ?1 AND is_active = 1"
            );
            Ok(reader.query_row(&sql, params![end_user_id], |row| row.get(0))?)
        };
        Ok(GraphCounts {
            dialogues: count("dialogues")?,
            chunks: count("chunks")?,
            statements: count("statements")?,
            entities: count("entities")?,
            summaries: count("summaries")?,
        })
    }

    /// Most-accessed entities for one user (hot memory tags)
    pub fn hot_entities(&self, end_user_id: &str, limit: usize) -> Result<Vec<(String, i64)>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT name, access_count FROM entities
             WHERE end_user_id = ?1 AND is_active = 1
             ORDER BY access_count DESC, name
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![end_user_id, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Statement type distribution for one user
    pub fn statement_type_counts(&self, end_user_id: &str) -> Result<Vec<(String, i64)>> {
        let reader = self.lock_reader()?;
        let mut stmt = reader.prepare(
            "SELECT stmt_type, COUNT(*) FROM statements
             WHERE end_user_id = ?1 AND is_active = 1
             GROUP BY stmt_type ORDER BY COUNT(*) DESC",
        )?;
        let rows = stmt
            .query_map(params![end_user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ========================================================================
    // ROW HYDRATION
    // ========================================================================

    /// Fetch full node properties for scored ids, preserving score order
    fn hydrate_hits(
        &self,
        category: NodeCategory,
        scored: &[(String, f64)],
    ) -> Result<Vec<NodeHit>> {
        let mut hits = Vec::with_capacity(scored.len());
        for (id, score) in scored {
            if let Some(props) = self.fetch_props(category, id)? {
                hits.push(NodeHit {
                    id: id.clone(),
                    score: *score,
                    category,
                    props,
                });
            }
        }
        Ok(hits)
    }

    fn fetch_props(&self, category: NodeCategory, id: &str) -> Result<Option<serde_json::Value>> {
        let reader = self.lock_reader()?;
        let props = match category {
            NodeCategory::Dialogue => reader
                .query_row(
                    "SELECT id, end_user_id, content, created_at FROM dialogues
                     WHERE id = ?1 AND is_active = 1",
                    params![id],
                    |row| {
                        Ok(serde_json::json!({
                            "id": row.get::<_, String>(0)?,
                            "endUserId": row.get::<_, String>(1)?,
                            "content": row.get::<_, String>(2)?,
                            "createdAt": row.get::<_, String>(3)?,
                        }))
                    },
                )
                .optional()?,
            NodeCategory::Chunk => reader
                .query_row(
                    "SELECT id, end_user_id, dialogue_id, content, created_at FROM chunks
                     WHERE id = ?1 AND is_active = 1",
                    params![id],
                    |row| {
                        Ok(serde_json::json!({
                            "id": row.get::<_, String>(0)?,
                            "endUserId": row.get::<_, String>(1)?,
                            "dialogueId": row.get::<_, String>(2)?,
                            "content": row.get::<_, String>(3)?,
                            "createdAt": row.get::<_, String>(4)?,
                        }))
                    },
                )
                .optional()?,
            NodeCategory::Statement => reader
                .query_row(
                    "SELECT id, end_user_id, chunk_id, statement, stmt_type, temporal_info,
                            valid_at, invalid_at, importance_score, activation_value,
                            access_history, created_at, version
                     FROM statements WHERE id = ?1 AND is_active = 1",
                    params![id],
                    |row| {
                        Ok(serde_json::json!({
                            "id": row.get::<_, String>(0)?,
                            "endUserId": row.get::<_, String>(1)?,
                            "chunkId": row.get::<_, String>(2)?,
                            "statement": row.get::<_, String>(3)?,
                            "stmtType": row.get::<_, String>(4)?,
                            "temporalInfo": row.get::<_, String>(5)?,
                            "validAt": row.get::<_, Option<String>>(6)?,
                            "invalidAt": row.get::<_, Option<String>>(7)?,
                            "importanceScore": row.get::<_, f64>(8)?,
                            "activationValue": row.get::<_, Option<f64>>(9)?,
                            "accessHistory": serde_json::from_str::<serde_json::Value>(
                                &row.get::<_, String>(10)?
                            ).unwrap_or_else(|_| serde_json::json!([])),
                            "createdAt": row.get::<_, String>(11)?,
                            "version": row.get::<_, i64>(12)?,
                        }))
                    },
                )
                .optional()?,
            NodeCategory::Entity => reader
                .query_row(
                    "SELECT id, end_user_id, name, entity_type, description, aliases,
                            importance_score, activation_value, access_history, created_at, version
                     FROM entities WHERE id = ?1 AND is_active = 1",
                    params![id],
                    |row| {
                        Ok(serde_json::json!({
                            "id": row.get::<_, String>(0)?,
                            "endUserId": row.get::<_, String>(1)?,
                            "name": row.get::<_, String>(2)?,
                            "entityType": row.get::<_, String>(3)?,
                            "description": row.get::<_, String>(4)?,
                            "aliases": serde_json::from_str::<serde_json::Value>(
                                &row.get::<_, String>(5)?
                            ).unwrap_or_else(|_| serde_json::json!([])),
                            "importanceScore": row.get::<_, f64>(6)?,
                            "activationValue": row.get::<_, Option<f64>>(7)?,
                            "accessHistory": serde_json::from_str::<serde_json::Value>(
                                &row.get::<_, String>(8)?
                            ).unwrap_or_else(|_| serde_json::json!([])),
                            "createdAt": row.get::<_, String>(9)?,
                            "version": row.get::<_, i64>(10)?,
                        }))
                    },
                )
                .optional()?,
            NodeCategory::Summary => reader
                .query_row(
                    "SELECT id, end_user_id, content, importance_score, activation_value,
                            access_history, created_at, version
                     FROM summaries WHERE id = ?1 AND is_active = 1",
                    params![id],
                    |row| {
                        Ok(serde_json::json!({
                            "id": row.get::<_, String>(0)?,
                            "endUserId": row.get::<_, String>(1)?,
                            "content": row.get::<_, String>(2)?,
                            "importanceScore": row.get::<_, f64>(3)?,
                            "activationValue": row.get::<_, Option<f64>>(4)?,
                            "accessHistory": serde_json::from_str::<serde_json::Value>(
                                &row.get::<_, String>(5)?
                            ).unwrap_or_else(|_| serde_json::json!([])),
                            "createdAt": row.get::<_, String>(6)?,
                            "version": row.get::<_, i64>(7)?,
                        }))
                    },
                )
                .optional()?,
        };
        Ok(props)
    }

    /// Read a statement by id (fusion, tests)
    pub fn get_statement(&self, id: &str) -> Result<Option<Statement>> {
        let reader = self.lock_reader()?;
        let row = reader
            .query_row(
                "SELECT id, end_user_id, chunk_id, statement, stmt_type, temporal_info,
                        valid_at, invalid_at, emotion_type, emotion_intensity, emotion_subject,
                        emotion_keywords, importance_score, activation_value, access_history,
                        created_at, version
                 FROM statements WHERE id = ?1 AND is_active = 1",
                params![id],
                |row| {
                    Ok(Statement {
                        id: row.get(0)?,
                        end_user_id: row.get(1)?,
                        chunk_id: row.get(2)?,
                        statement: row.get(3)?,
                        stmt_type: StmtType::parse_name(&row.get::<_, String>(4)?),
                        temporal_info: TemporalInfo::parse_name(&row.get::<_, String>(5)?),
                        valid_at: row
                            .get::<_, Option<String>>(6)?
                            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                            .map(|t| t.with_timezone(&Utc)),
                        invalid_at: row
                            .get::<_, Option<String>>(7)?
                            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                            .map(|t| t.with_timezone(&Utc)),
                        emotion_type: row.get(8)?,
                        emotion_intensity: row.get(9)?,
                        emotion_subject: row.get(10)?,
                        emotion_keywords: serde_json::from_str(&row.get::<_, String>(11)?)
                            .unwrap_or_default(),
                        importance_score: row.get(12)?,
                        activation_value: row.get(13)?,
                        access_history: history_from_json(&row.get::<_, String>(14)?),
                        created_at: parse_timestamp(&row.get::<_, String>(15)?)?,
                        version: row.get(16)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Prepare untrusted text for an FTS5 MATCH expression
///
/// Each whitespace token is double-quoted (escaping embedded quotes) and the
/// tokens are OR-joined so any term can match.
pub fn sanitize_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn parse_timestamp(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn history_from_json(json: &str) -> Vec<DateTime<Utc>> {
    serde_json::from_str::<Vec<String>>(json)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
        .collect()
}

fn history_to_json(history: &[DateTime<Utc>]) -> Result<String> {
    let strings: Vec<String> = history.iter().map(|t| t.to_rfc3339()).collect();
    Ok(serde_json::to_string(&strings)?)
}

/// Union two access histories, sorted, deduplicated, keeping the newest `cap`
fn merge_histories(
    a: &[DateTime<Utc>],
    b: &[DateTime<Utc>],
    cap: usize,
) -> Vec<DateTime<Utc>> {
    let mut merged: Vec<DateTime<Utc>> = a.iter().chain(b.iter()).copied().collect();
    merged.sort();
    merged.dedup();
    if merged.len() > cap {
        merged.drain(..merged.len() - cap);
    }
    merged
}

fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn vector_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::{EdgeKind, GraphEdge};

    fn sample_batch(user: &str) -> IngestBatch {
        let now = Utc::now();
        let dialogue_id = Uuid::new_v4().to_string();
        let chunk_id = Uuid::new_v4().to_string();
        let stmt_id = Uuid::new_v4().to_string();
        let entity_id = Uuid::new_v4().to_string();
        let summary_id = Uuid::new_v4().to_string();

        IngestBatch {
            dialogue: Some(Dialogue {
                id: dialogue_id.clone(),
                end_user_id: user.to_string(),
                content: "user: I moved to Berlin last month".to_string(),
                created_at: now,
            }),
            chunks: vec![Chunk {
                id: chunk_id.clone(),
                end_user_id: user.to_string(),
                dialogue_id: dialogue_id.clone(),
                content: "I moved to Berlin last month".to_string(),
                created_at: now,
            }],
            statements: vec![Statement {
                id: stmt_id.clone(),
                end_user_id: user.to_string(),
                chunk_id: chunk_id.clone(),
                statement: "The user moved to Berlin".to_string(),
                stmt_type: StmtType::Fact,
                temporal_info: TemporalInfo::Dynamic,
                valid_at: Some(now),
                invalid_at: None,
                emotion_type: None,
                emotion_intensity: None,
                emotion_subject: None,
                emotion_keywords: vec![],
                importance_score: 0.7,
                activation_value: None,
                access_history: vec![],
                created_at: now,
                version: 0,
            }],
            entities: vec![ExtractedEntity {
                id: entity_id.clone(),
                end_user_id: user.to_string(),
                name: "Berlin".to_string(),
                entity_type: "city".to_string(),
                description: "City the user moved to".to_string(),
                aliases: vec![],
                connect_strength: 1.0,
                is_explicit_memory: true,
                importance_score: 0.6,
                activation_value: None,
                access_history: vec![],
                created_at: now,
                version: 0,
            }],
            summaries: vec![MemorySummary {
                id: summary_id.clone(),
                end_user_id: user.to_string(),
                content: "The user relocated to Berlin recently".to_string(),
                importance_score: 0.5,
                activation_value: None,
                access_history: vec![],
                created_at: now,
                version: 0,
            }],
            edges: vec![
                GraphEdge::new(dialogue_id, chunk_id.clone(), EdgeKind::HasChunk),
                GraphEdge::new(chunk_id, stmt_id.clone(), EdgeKind::HasStatement),
                GraphEdge::new(stmt_id.clone(), entity_id, EdgeKind::Mentions),
                GraphEdge::new(summary_id, stmt_id, EdgeKind::DerivedFromStatement),
            ],
            embeddings: vec![],
        }
    }

    use crate::graph::types::{MemorySummary, Statement};

    #[test]
    fn test_batch_upsert_and_keyword_search() {
        let store = GraphStore::in_memory().unwrap();
        store.upsert_ingested_batch(&sample_batch("u1")).unwrap();

        let hits = store
            .keyword_search(NodeCategory::Statement, "u1", "Berlin", 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.0);
        assert_eq!(hits[0].content(), Some("The user moved to Berlin"));

        // Scope isolation: another user sees nothing
        let other = store
            .keyword_search(NodeCategory::Statement, "u2", "Berlin", 10)
            .unwrap();
        assert!(other.is_empty());
    }

    #[test]
    fn test_counts_after_ingest() {
        let store = GraphStore::in_memory().unwrap();
        store.upsert_ingested_batch(&sample_batch("u1")).unwrap();
        let counts = store.count_nodes("u1").unwrap();
        assert_eq!(counts.dialogues, 1);
        assert_eq!(counts.chunks, 1);
        assert_eq!(counts.statements, 1);
        assert_eq!(counts.entities, 1);
        assert_eq!(counts.summaries, 1);
        assert_eq!(counts.total(), 5);
    }

    #[test]
    fn test_duplicate_entity_name_fails_whole_batch() {
        let store = GraphStore::in_memory().unwrap();
        store.upsert_ingested_batch(&sample_batch("u1")).unwrap();
        let before = store.count_nodes("u1").unwrap().total();

        // Second batch reuses the entity name in the same scope: the unique
        // constraint fires and nothing from the batch persists
        let result = store.upsert_ingested_batch(&sample_batch("u1"));
        assert!(matches!(result, Err(MemoryError::PersistFailed(_))));
        assert_eq!(store.count_nodes("u1").unwrap().total(), before);
    }

    #[test]
    fn test_activation_optimistic_update() {
        let store = GraphStore::in_memory().unwrap();
        let batch = sample_batch("u1");
        let stmt_id = batch.statements[0].id.clone();
        store.upsert_ingested_batch(&batch).unwrap();

        let rows = store
            .fetch_activation_rows(NodeCategory::Statement, &[stmt_id.clone()])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].version, 0);

        let now = Utc::now();
        let applied = store
            .batch_update_activation(
                NodeCategory::Statement,
                &[ActivationWrite {
                    id: stmt_id.clone(),
                    expected_version: 0,
                    new_history: vec![now],
                    new_activation: Some(1.25),
                    accessed_at: now,
                }],
            )
            .unwrap();
        assert_eq!(applied, vec![stmt_id.clone()]);

        // Stale version loses the race
        let stale = store
            .batch_update_activation(
                NodeCategory::Statement,
                &[ActivationWrite {
                    id: stmt_id.clone(),
                    expected_version: 0,
                    new_history: vec![now],
                    new_activation: Some(2.0),
                    accessed_at: now,
                }],
            )
            .unwrap();
        assert!(stale.is_empty());

        let statement = store.get_statement(&stmt_id).unwrap().unwrap();
        assert_eq!(statement.version, 1);
        assert!((statement.activation_value.unwrap() - 1.25).abs() < 1e-9);
        assert_eq!(statement.access_history.len(), 1);
    }

    #[test]
    fn test_activation_rejected_for_raw_text_layer() {
        let store = GraphStore::in_memory().unwrap();
        let result = store.fetch_activation_rows(NodeCategory::Chunk, &["c1".to_string()]);
        assert!(matches!(result, Err(MemoryError::InvalidInput(_))));
    }

    #[test]
    fn test_merge_entities_unions_aliases_and_moves_edges() {
        let store = GraphStore::in_memory().unwrap();
        let batch_a = sample_batch("u1");
        let entity_a = batch_a.entities[0].id.clone();
        store.upsert_ingested_batch(&batch_a).unwrap();

        let mut batch_b = sample_batch("u1");
        batch_b.entities[0].name = "Berlin City".to_string();
        batch_b.entities[0].aliases = vec!["BER".to_string()];
        let entity_b = batch_b.entities[0].id.clone();
        store.upsert_ingested_batch(&batch_b).unwrap();

        let outcome = store.merge_entities(&entity_a, &entity_b, 50).unwrap();
        assert!(outcome.edges_moved > 0);

        let survivor = store.get_entity(&entity_a).unwrap().unwrap();
        assert!(survivor.matches_name("Berlin City"));
        assert!(survivor.matches_name("BER"));
        assert!(store.get_entity(&entity_b).unwrap().is_none());
    }

    #[test]
    fn test_merged_entity_frees_unique_name_slot() {
        let store = GraphStore::in_memory().unwrap();
        let batch = sample_batch("u1");
        let entity_id = batch.entities[0].id.clone();
        store.upsert_ingested_batch(&batch).unwrap();

        store.soft_delete(NodeCategory::Entity, &entity_id).unwrap();

        // Name slot is free again after the soft delete
        let mut batch_b = sample_batch("u1");
        batch_b.dialogue = None;
        batch_b.chunks.clear();
        batch_b.statements.clear();
        batch_b.summaries.clear();
        batch_b.edges.clear();
        store.upsert_ingested_batch(&batch_b).unwrap();
    }

    #[test]
    fn test_dedup_candidates_by_name() {
        let store = GraphStore::in_memory().unwrap();
        store.upsert_ingested_batch(&sample_batch("u1")).unwrap();

        let candidates = store.find_entity_candidates("u1", "berlin").unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].entity.matches_name("BERLIN"));

        let none = store.find_entity_candidates("u1", "tokyo").unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_temporal_search_window() {
        let store = GraphStore::in_memory().unwrap();
        store.upsert_ingested_batch(&sample_batch("u1")).unwrap();

        let range = TemporalRange {
            start: Some(Utc::now() - chrono::Duration::hours(1)),
            end: Some(Utc::now() + chrono::Duration::hours(1)),
            valid_at: None,
        };
        let hits = store.temporal_search("u1", &range, 10).unwrap();
        assert_eq!(hits.len(), 1);

        let past = TemporalRange {
            start: None,
            end: Some(Utc::now() - chrono::Duration::days(1)),
            valid_at: None,
        };
        assert!(store.temporal_search("u1", &past, 10).unwrap().is_empty());
    }

    #[test]
    fn test_chunk_and_dialogue_lookups() {
        let store = GraphStore::in_memory().unwrap();
        let batch = sample_batch("u1");
        let chunk_id = batch.chunks[0].id.clone();
        let dialogue_id = batch.dialogue.as_ref().unwrap().id.clone();
        store.upsert_ingested_batch(&batch).unwrap();

        let chunk = store.get_by_chunk_id("u1", &chunk_id).unwrap().unwrap();
        assert_eq!(chunk.dialogue_id, dialogue_id);

        let chunks = store.get_by_dialogue_id("u1", &dialogue_id).unwrap();
        assert_eq!(chunks.len(), 1);

        assert!(store.get_by_chunk_id("u2", &chunk_id).unwrap().is_none());
    }

    #[test]
    fn test_sanitize_fts_query() {
        assert_eq!(sanitize_fts_query("hello world"), "\"hello\" OR \"world\"");
        assert_eq!(sanitize_fts_query("  "), "");
        assert_eq!(sanitize_fts_query("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_merge_histories_caps_and_dedups() {
        let base = Utc::now();
        let a: Vec<_> = (0..5).map(|i| base + chrono::Duration::seconds(i)).collect();
        let b: Vec<_> = (3..8).map(|i| base + chrono::Duration::seconds(i)).collect();
        let merged = merge_histories(&a, &b, 6);
        assert_eq!(merged.len(), 6);
        // Newest entries survive the cap
        assert_eq!(merged.last().copied(), Some(base + chrono::Duration::seconds(7)));
        assert!(merged.windows(2).all(|w| w[0] < w[1]));
    }
}

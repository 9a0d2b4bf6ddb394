//! Hybrid Retrieval & Reranking
//!
//! Keyword (bm25) and dense-vector searches run in parallel per included
//! category, results are deduplicated, knowledge hits get their activation
//! recorded, scores are z-score+sigmoid normalized, and a two-stage rerank
//! orders the output: content relevance selects the candidate set, ACT-R
//! activation orders it.
//!
//! Score fields on every reranked item:
//! - `bm25_score` / `embedding_score`: normalized per-branch scores
//! - `content_score`: `alpha * bm25 + (1 - alpha) * embedding`
//! - `activation_score`: normalized activation, absent for never-accessed nodes
//! - `base_score`: stage-1 key (content score, optionally forgetting-weighted)
//! - `final_score`: activation score when present, base score otherwise

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::activation::AccessHistoryManager;
use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::forgetting::{ebbinghaus_weight, ForgettingConfig};
use crate::graph::{GraphStore, NodeCategory, NodeHit};
use crate::provider::LanguageModel;

/// Cached query embeddings, keyed by `model\x1fquery`
const QUERY_CACHE_CAPACITY: usize = 100;

// ============================================================================
// SCORE NORMALIZATION
// ============================================================================

/// Z-score normalization followed by a sigmoid squash into `[0, 1]`
///
/// `None` entries stay `None`: a node without an activation value is
/// distinguishable from one whose activation normalized to zero. A single
/// valid score, or zero variance, normalizes every valid entry to 1.0.
pub fn normalize_scores(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let valid: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    if valid.is_empty() {
        return values.to_vec();
    }

    if valid.len() == 1 {
        return values
            .iter()
            .map(|v| v.map(|_| 1.0))
            .collect();
    }

    let mean = valid.iter().sum::<f64>() / valid.len() as f64;
    let variance = valid.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / valid.len() as f64;
    let std_dev = variance.sqrt();

    if std_dev == 0.0 {
        return values.iter().map(|v| v.map(|_| 1.0)).collect();
    }

    values
        .iter()
        .map(|v| {
            v.map(|score| {
                let z = (score - mean) / std_dev;
                1.0 / (1.0 + (-z).exp())
            })
        })
        .collect()
}

/// Drop duplicates by id, then by normalized content (lowercased, trimmed),
/// preserving first occurrence
pub fn deduplicate_hits(hits: Vec<NodeHit>) -> Vec<NodeHit> {
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut seen_content: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(hits.len());

    for hit in hits {
        let normalized = hit
            .content()
            .map(|c| c.trim().to_lowercase())
            .unwrap_or_default();

        let duplicate = seen_ids.contains(&hit.id)
            || (!normalized.is_empty() && seen_content.contains(&normalized));
        if duplicate {
            continue;
        }
        seen_ids.insert(hit.id.clone());
        if !normalized.is_empty() {
            seen_content.insert(normalized);
        }
        out.push(hit);
    }
    out
}

// ============================================================================
// RANKED ITEMS
// ============================================================================

/// One reranked hit with all score metadata
#[derive(Debug, Clone, Serialize)]
pub struct RankedItem {
    /// Node id, duplicated out of the props for convenience
    pub id: String,
    #[serde(flatten)]
    pub props: serde_json::Value,
    pub bm25_score: f64,
    pub embedding_score: f64,
    pub content_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_score: Option<f64>,
    pub base_score: f64,
    pub final_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forgetting_weight: Option<f64>,
}

impl RankedItem {
    fn content_key(&self) -> String {
        for key in ["text", "content", "statement", "name"] {
            if let Some(value) = self.props.get(key).and_then(|v| v.as_str()) {
                return value.trim().to_lowercase();
            }
        }
        String::new()
    }
}

/// Parameters of the forgetting weighting inside rerank
#[derive(Debug, Clone, Copy)]
pub struct ForgettingRerank {
    pub tau_days: f64,
    pub activation_boost_factor: f64,
}

/// Two-stage rerank of merged keyword + embedding results
///
/// Stage 1 selects `limit * candidate_multiplier` candidates by content
/// relevance; stage 2 orders candidates by activation, topping up from the
/// activation-free remainder in stage-1 order.
pub fn rerank_with_activation(
    keyword_results: &BTreeMap<NodeCategory, Vec<NodeHit>>,
    embedding_results: &BTreeMap<NodeCategory, Vec<NodeHit>>,
    include: &[NodeCategory],
    alpha: f64,
    limit: usize,
    candidate_multiplier: usize,
    forgetting: Option<ForgettingRerank>,
    now: DateTime<Utc>,
) -> Result<BTreeMap<NodeCategory, Vec<RankedItem>>> {
    if !(0.0..=1.0).contains(&alpha) {
        return Err(MemoryError::InvalidInput(format!(
            "alpha must be in [0, 1], got {alpha}"
        )));
    }

    let empty: Vec<NodeHit> = vec![];
    let mut reranked = BTreeMap::new();

    for category in include {
        let keyword_items = keyword_results.get(category).unwrap_or(&empty);
        let embedding_items = embedding_results.get(category).unwrap_or(&empty);

        // Normalize each branch's raw scores
        let keyword_norm = normalize_scores(
            &keyword_items.iter().map(|h| Some(h.score)).collect::<Vec<_>>(),
        );
        let embedding_norm = normalize_scores(
            &embedding_items.iter().map(|h| Some(h.score)).collect::<Vec<_>>(),
        );

        // Merge branches by id
        struct Merged {
            hit: NodeHit,
            bm25: f64,
            embedding: f64,
        }
        let mut combined: Vec<Merged> = Vec::new();
        let mut index_by_id: HashMap<String, usize> = HashMap::new();

        for (hit, norm) in keyword_items.iter().zip(keyword_norm.iter()) {
            index_by_id.insert(hit.id.clone(), combined.len());
            combined.push(Merged {
                hit: hit.clone(),
                bm25: norm.unwrap_or(0.0),
                embedding: 0.0,
            });
        }
        for (hit, norm) in embedding_items.iter().zip(embedding_norm.iter()) {
            match index_by_id.get(&hit.id) {
                Some(&i) => combined[i].embedding = norm.unwrap_or(0.0),
                None => {
                    index_by_id.insert(hit.id.clone(), combined.len());
                    combined.push(Merged {
                        hit: hit.clone(),
                        bm25: 0.0,
                        embedding: norm.unwrap_or(0.0),
                    });
                }
            }
        }

        // Normalize activation across the merged set; nil stays nil
        let activation_norm = normalize_scores(
            &combined
                .iter()
                .map(|m| m.hit.activation_value())
                .collect::<Vec<_>>(),
        );

        let mut items: Vec<RankedItem> = combined
            .into_iter()
            .zip(activation_norm.into_iter())
            .map(|(merged, activation_score)| {
                let content_score = alpha * merged.bm25 + (1.0 - alpha) * merged.embedding;
                let mut base_score = content_score;
                let mut forgetting_weight = None;

                if let Some(params) = forgetting {
                    // Only nodes with a real activation value decay
                    if let Some(activation) = merged.hit.activation_value() {
                        let strength = crate::activation::memory_strength(
                            merged.hit.importance_score(),
                            activation,
                            params.activation_boost_factor,
                        );
                        let elapsed_days = merged
                            .hit
                            .created_at()
                            .map(|created| {
                                ((now - created).num_seconds() as f64 / 86_400.0).max(0.0)
                            })
                            .unwrap_or(0.0);
                        let weight = ebbinghaus_weight(elapsed_days, strength, params.tau_days);
                        forgetting_weight = Some(weight);
                        base_score *= weight;
                    }
                }

                RankedItem {
                    id: merged.hit.id.clone(),
                    props: merged.hit.props,
                    bm25_score: merged.bm25,
                    embedding_score: merged.embedding,
                    content_score,
                    activation_score,
                    base_score,
                    final_score: base_score,
                    forgetting_weight,
                }
            })
            .collect();

        // Stage 1: content-relevance candidate set
        items.sort_by(|a, b| {
            b.base_score
                .partial_cmp(&a.base_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        items.truncate(limit * candidate_multiplier.max(1));

        // Stage 2: activation ordering, topping up with activation-free items
        let (mut with_activation, without_activation): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|i| i.activation_score.is_some());
        with_activation.sort_by(|a, b| {
            b.activation_score
                .partial_cmp(&a.activation_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut selected = if with_activation.len() >= limit {
            with_activation.into_iter().take(limit).collect::<Vec<_>>()
        } else {
            let needed = limit - with_activation.len();
            with_activation
                .into_iter()
                .chain(without_activation.into_iter().take(needed))
                .collect()
        };

        // The reported rank key: activation when present, content otherwise
        for item in &mut selected {
            item.final_score = item.activation_score.unwrap_or(item.base_score);
        }

        // Final dedup by id then content
        let mut seen_ids = HashSet::new();
        let mut seen_content = HashSet::new();
        selected.retain(|item| {
            let content = item.content_key();
            if seen_ids.contains(&item.id) || (!content.is_empty() && seen_content.contains(&content))
            {
                return false;
            }
            seen_ids.insert(item.id.clone());
            if !content.is_empty() {
                seen_content.insert(content);
            }
            true
        });

        reranked.insert(*category, selected);
    }

    Ok(reranked)
}

// ============================================================================
// SEARCH SURFACE
// ============================================================================

/// Search modes on the hybrid surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Keyword,
    Embedding,
    #[default]
    Hybrid,
}

/// Request on the hybrid-search surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub end_user_id: String,
    pub query_text: String,
    #[serde(default)]
    pub search_type: SearchType,
    /// Categories to search; empty means all searchable categories
    #[serde(default)]
    pub include: Vec<NodeCategory>,
    pub limit: usize,
    /// Override of the config's rerank alpha
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_alpha: Option<f64>,
    /// Override of the config's activation boost factor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_boost_factor: Option<f64>,
    #[serde(default)]
    pub use_forgetting_rerank: bool,
}

impl SearchRequest {
    pub fn included(&self) -> Vec<NodeCategory> {
        if self.include.is_empty() {
            NodeCategory::SEARCHABLE.to_vec()
        } else {
            self.include.clone()
        }
    }
}

/// Per-phase latency in seconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_search_latency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_search_latency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranking_latency: Option<f64>,
    pub total_latency: f64,
}

/// Aggregate block attached to every search response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedSummary {
    pub total_keyword_results: usize,
    pub total_embedding_results: usize,
    pub total_reranked_results: usize,
    pub search_query: String,
    pub search_timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranking_alpha: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_boost_factor: Option<f64>,
    #[serde(default)]
    pub forgetting_rerank: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_metrics: LatencyMetrics,
}

/// Response of the hybrid-search surface
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword_search: Option<BTreeMap<NodeCategory, Vec<NodeHit>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_search: Option<BTreeMap<NodeCategory, Vec<NodeHit>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reranked_results: Option<BTreeMap<NodeCategory, Vec<RankedItem>>>,
    pub combined_summary: CombinedSummary,
}

fn total_hits<T>(map: &BTreeMap<NodeCategory, Vec<T>>) -> usize {
    map.values().map(|v| v.len()).sum()
}

// ============================================================================
// RETRIEVER
// ============================================================================

/// Hybrid retriever over the graph store and an embedding provider
pub struct HybridRetriever {
    store: Arc<GraphStore>,
    model: Arc<dyn LanguageModel>,
    access: AccessHistoryManager,
    forgetting_config: ForgettingConfig,
    /// LRU cache so repeated queries skip the embedding call
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl HybridRetriever {
    pub fn new(store: Arc<GraphStore>, model: Arc<dyn LanguageModel>) -> Self {
        Self {
            access: AccessHistoryManager::new(store.clone()),
            store,
            model,
            forgetting_config: ForgettingConfig::default(),
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    pub fn with_forgetting_config(mut self, config: ForgettingConfig) -> Self {
        self.forgetting_config = config;
        self
    }

    /// Run a search per the request's mode
    pub async fn search(
        &self,
        request: &SearchRequest,
        config: &MemoryConfig,
    ) -> Result<SearchResponse> {
        let started = Instant::now();
        let query = request.query_text.trim().to_string();
        let include = request.included();

        if query.is_empty() {
            tracing::warn!("empty query after cleaning, returning empty results");
            return Ok(empty_response(&include));
        }

        let alpha = request.rerank_alpha.unwrap_or(config.rerank_alpha);
        let boost = request
            .activation_boost_factor
            .unwrap_or(config.activation_boost_factor);
        if !(0.0..=1.0).contains(&alpha) {
            return Err(MemoryError::InvalidInput(format!(
                "rerank_alpha must be in [0, 1], got {alpha}"
            )));
        }

        let mut metrics = LatencyMetrics::default();
        let run_keyword = matches!(request.search_type, SearchType::Keyword | SearchType::Hybrid);
        let run_embedding = matches!(request.search_type, SearchType::Embedding | SearchType::Hybrid);

        // Launch both branches concurrently; category queries fan out inside
        let keyword_branch = async {
            if !run_keyword {
                return Ok::<_, MemoryError>((BTreeMap::new(), None));
            }
            let branch_start = Instant::now();
            let results = self
                .keyword_branch(&request.end_user_id, &query, &include, request.limit)
                .await?;
            Ok((results, Some(branch_start.elapsed().as_secs_f64())))
        };
        let embedding_branch = async {
            if !run_embedding {
                return Ok::<_, MemoryError>((BTreeMap::new(), None));
            }
            let branch_start = Instant::now();
            let results = self
                .embedding_branch(
                    &request.end_user_id,
                    &query,
                    &include,
                    request.limit,
                    &config.embedding_model_id,
                )
                .await?;
            Ok((results, Some(branch_start.elapsed().as_secs_f64())))
        };

        let (keyword_out, embedding_out) = tokio::join!(keyword_branch, embedding_branch);
        let (mut keyword_results, keyword_latency) = keyword_out?;
        let (mut embedding_results, embedding_latency) = embedding_out?;
        metrics.keyword_search_latency = keyword_latency;
        metrics.embedding_search_latency = embedding_latency;

        // Per-category dedup inside each branch
        for results in [&mut keyword_results, &mut embedding_results] {
            for (_, hits) in results.iter_mut() {
                let deduped = deduplicate_hits(std::mem::take(hits));
                *hits = deduped;
            }
        }

        // Record one access per knowledge node across both branches
        self.update_activation(
            &request.end_user_id,
            &mut keyword_results,
            &mut embedding_results,
            config,
        );

        let mut response = SearchResponse {
            combined_summary: CombinedSummary {
                total_keyword_results: total_hits(&keyword_results),
                total_embedding_results: total_hits(&embedding_results),
                search_query: query.clone(),
                search_timestamp: Utc::now().to_rfc3339(),
                ..Default::default()
            },
            ..Default::default()
        };

        if request.search_type == SearchType::Hybrid {
            let rerank_start = Instant::now();
            let forgetting = request.use_forgetting_rerank.then_some(ForgettingRerank {
                tau_days: self.forgetting_config.tau_days,
                activation_boost_factor: boost,
            });
            let mut reranked = rerank_with_activation(
                &keyword_results,
                &embedding_results,
                &include,
                alpha,
                request.limit,
                config.candidate_multiplier,
                forgetting,
                Utc::now(),
            )?;
            metrics.reranking_latency = Some(rerank_start.elapsed().as_secs_f64());

            response.combined_summary.total_reranked_results = total_hits(&reranked);
            response.combined_summary.reranking_alpha = Some(alpha);
            response.combined_summary.activation_boost_factor = Some(boost);
            response.combined_summary.forgetting_rerank = request.use_forgetting_rerank;
            fill_omitted(&mut reranked);
            response.reranked_results = Some(reranked);
        }

        // Omitted categories report as empty lists; no query ran for them
        if run_keyword {
            fill_omitted(&mut keyword_results);
            response.keyword_search = Some(keyword_results);
        }
        if run_embedding {
            fill_omitted(&mut embedding_results);
            response.embedding_search = Some(embedding_results);
        }

        metrics.total_latency = started.elapsed().as_secs_f64();
        response.combined_summary.latency_metrics = metrics;

        tracing::info!(
            query = %query,
            search_type = ?request.search_type,
            keyword = response.combined_summary.total_keyword_results,
            embedding = response.combined_summary.total_embedding_results,
            reranked = response.combined_summary.total_reranked_results,
            "search completed"
        );

        Ok(response)
    }

    async fn keyword_branch(
        &self,
        end_user_id: &str,
        query: &str,
        include: &[NodeCategory],
        limit: usize,
    ) -> Result<BTreeMap<NodeCategory, Vec<NodeHit>>> {
        let mut tasks = Vec::with_capacity(include.len());
        for category in include {
            let store = self.store.clone();
            let user = end_user_id.to_string();
            let q = query.to_string();
            let category = *category;
            tasks.push(tokio::task::spawn_blocking(move || {
                (category, store.keyword_search(category, &user, &q, limit))
            }));
        }

        let mut results = BTreeMap::new();
        for task in tasks {
            let (category, outcome) = task
                .await
                .map_err(|e| MemoryError::Init(format!("search task panicked: {e}")))?;
            match outcome {
                Ok(hits) => {
                    results.insert(category, hits);
                }
                Err(e) => {
                    // A failed category yields an empty list, not a failed search
                    tracing::warn!(category = %category, "keyword search failed: {}", e);
                    results.insert(category, vec![]);
                }
            }
        }
        Ok(results)
    }

    async fn embedding_branch(
        &self,
        end_user_id: &str,
        query: &str,
        include: &[NodeCategory],
        limit: usize,
        embedding_model: &str,
    ) -> Result<BTreeMap<NodeCategory, Vec<NodeHit>>> {
        let vector = self.query_embedding(embedding_model, query).await?;
        if vector.is_empty() {
            return Ok(include.iter().map(|c| (*c, vec![])).collect());
        }

        let mut tasks = Vec::with_capacity(include.len());
        for category in include {
            let store = self.store.clone();
            let user = end_user_id.to_string();
            let v = vector.clone();
            let category = *category;
            tasks.push(tokio::task::spawn_blocking(move || {
                (category, store.embedding_search(category, &user, &v, limit))
            }));
        }

        let mut results = BTreeMap::new();
        for task in tasks {
            let (category, outcome) = task
                .await
                .map_err(|e| MemoryError::Init(format!("search task panicked: {e}")))?;
            match outcome {
                Ok(hits) => {
                    results.insert(category, hits);
                }
                Err(e) => {
                    tracing::warn!(category = %category, "embedding search failed: {}", e);
                    results.insert(category, vec![]);
                }
            }
        }
        Ok(results)
    }

    async fn query_embedding(&self, model: &str, query: &str) -> Result<Vec<f32>> {
        let cache_key = format!("{model}\x1f{query}");
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(vector) = cache.get(&cache_key) {
                return Ok(vector.clone());
            }
        }

        let vectors = self.model.embed(model, &[query.to_string()]).await?;
        let vector = vectors.into_iter().next().unwrap_or_default();

        if let Ok(mut cache) = self.query_cache.lock() {
            cache.put(cache_key, vector.clone());
        }
        Ok(vector)
    }

    /// Record accesses on knowledge hits and fold new activation values back
    /// into the in-memory result props
    fn update_activation(
        &self,
        _end_user_id: &str,
        keyword_results: &mut BTreeMap<NodeCategory, Vec<NodeHit>>,
        embedding_results: &mut BTreeMap<NodeCategory, Vec<NodeHit>>,
        config: &MemoryConfig,
    ) {
        let now = Utc::now();
        for category in NodeCategory::KNOWLEDGE {
            let mut ids: Vec<String> = Vec::new();
            for results in [&*keyword_results, &*embedding_results] {
                if let Some(hits) = results.get(&category) {
                    ids.extend(hits.iter().map(|h| h.id.clone()));
                }
            }
            if ids.is_empty() {
                continue;
            }

            match self
                .access
                .record_batch_access(category, &ids, config, now)
            {
                Ok(result) => {
                    let updated: HashMap<&str, f64> = result
                        .activations
                        .iter()
                        .map(|(id, value)| (id.as_str(), *value))
                        .collect();
                    for results in [&mut *keyword_results, &mut *embedding_results] {
                        if let Some(hits) = results.get_mut(&category) {
                            for hit in hits {
                                if let Some(value) = updated.get(hit.id.as_str()) {
                                    hit.props["activationValue"] =
                                        serde_json::json!(*value);
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    // Losing an activation update never fails the read path
                    tracing::warn!(category = %category, "activation update failed: {}", e);
                }
            }
        }
    }
}

/// Ensure every searchable category is present, empty when never queried
fn fill_omitted<T>(map: &mut BTreeMap<NodeCategory, Vec<T>>) {
    for category in NodeCategory::SEARCHABLE {
        map.entry(category).or_default();
    }
}

/// Response for a blank query: every included category present and empty
fn empty_response(include: &[NodeCategory]) -> SearchResponse {
    let empty_hits: BTreeMap<NodeCategory, Vec<NodeHit>> =
        include.iter().map(|c| (*c, vec![])).collect();
    let empty_ranked: BTreeMap<NodeCategory, Vec<RankedItem>> =
        include.iter().map(|c| (*c, vec![])).collect();
    SearchResponse {
        keyword_search: Some(empty_hits.clone()),
        embedding_search: Some(empty_hits),
        reranked_results: Some(empty_ranked),
        combined_summary: CombinedSummary {
            search_timestamp: Utc::now().to_rfc3339(),
            error: Some("Empty query".to_string()),
            ..Default::default()
        },
    }
}

// ============================================================================
// TESTS
// ============================================================================

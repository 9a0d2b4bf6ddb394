//! Forgetting Engine
//!
//! Two responsibilities:
//!
//! 1. The Ebbinghaus weight `w = exp(-dt_days / (tau * strength))`, applied
//!    to content scores during rerank when forgetting weighting is enabled.
//! 2. The periodic forgetting cycle: scan knowledge nodes whose activation
//!    has dropped below the configured threshold, pair them by embedding
//!    similarity within one user scope, and fuse each pair keeping the
//!    LLM-chosen surviving content. A failed fusion keeps both nodes and is
//!    retried next cycle.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::graph::{GraphStore, NodeCategory, NodeHit};
use crate::provider::{chat_structured, ChatMessage, ChatOptions, LanguageModel};

// ============================================================================
// WEIGHT FUNCTION
// ============================================================================

/// Configuration for the forgetting weight and cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgettingConfig {
    /// Time constant of the forgetting curve, in days
    pub tau_days: f64,
    /// Cosine similarity above which two low-activation nodes are fused
    pub fusion_threshold: f64,
    /// Maximum candidates scanned per category per cycle
    pub scan_limit: usize,
}

impl Default for ForgettingConfig {
    fn default() -> Self {
        Self {
            tau_days: 7.0,
            fusion_threshold: 0.9,
            scan_limit: 200,
        }
    }
}

/// Ebbinghaus retention weight in `(0, 1]`
///
/// Stronger memories and shorter elapsed times both push the weight toward 1.
pub fn ebbinghaus_weight(elapsed_days: f64, memory_strength: f64, tau_days: f64) -> f64 {
    let strength = memory_strength.max(f64::EPSILON);
    let tau = tau_days.max(f64::EPSILON);
    (-elapsed_days.max(0.0) / (tau * strength)).exp()
}

// ============================================================================
// FORGETTING CYCLE
// ============================================================================

/// Counters reported by one forgetting cycle
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgettingReport {
    pub scanned: usize,
    pub merged: usize,
    pub failed: usize,
}

/// One candidate pair, highest-similarity first
#[derive(Debug, Clone)]
pub struct FusionPair {
    pub category: NodeCategory,
    pub end_user_id: String,
    pub first_id: String,
    pub second_id: String,
    pub similarity: f64,
}

#[derive(Debug, Deserialize)]
struct FusionDecision {
    surviving_content: String,
    /// "first" or "second"
    keep: String,
}

/// Periodic low-activation node fusion driver
pub struct ForgettingEngine {
    store: Arc<GraphStore>,
    model: Arc<dyn LanguageModel>,
    config: ForgettingConfig,
}

impl ForgettingEngine {
    pub fn new(
        store: Arc<GraphStore>,
        model: Arc<dyn LanguageModel>,
        config: ForgettingConfig,
    ) -> Self {
        Self {
            store,
            model,
            config,
        }
    }

    pub fn config(&self) -> &ForgettingConfig {
        &self.config
    }

    /// Scan for low-activation nodes and produce fusion pairs
    ///
    /// Pairs are formed greedily per user scope: each node joins at most one
    /// pair, taking its most similar partner above the fusion threshold.
    pub fn candidate_pairs(
        &self,
        category: NodeCategory,
        end_user_id: Option<&str>,
        memory_config: &MemoryConfig,
    ) -> Result<(usize, Vec<FusionPair>)> {
        let candidates = self.store.low_activation_nodes(
            category,
            end_user_id,
            memory_config.forgetting_threshold,
            self.config.scan_limit,
        )?;
        let scanned = candidates.len();
        if scanned < 2 {
            return Ok((scanned, vec![]));
        }

        // Embeddings for each candidate; nodes without one cannot be paired
        let mut embedded: Vec<(&NodeHit, Vec<f32>)> = Vec::with_capacity(candidates.len());
        for hit in &candidates {
            if let Some(vector) = self.store.get_embedding(&hit.id)? {
                embedded.push((hit, vector));
            }
        }

        let mut pairs = Vec::new();
        let mut taken: HashSet<&str> = HashSet::new();
        for i in 0..embedded.len() {
            if taken.contains(embedded[i].0.id.as_str()) {
                continue;
            }
            let user_i = embedded[i]
                .0
                .props
                .get("endUserId")
                .and_then(|v| v.as_str())
                .unwrap_or_default();

            let mut best: Option<(usize, f64)> = None;
            for j in (i + 1)..embedded.len() {
                if taken.contains(embedded[j].0.id.as_str()) {
                    continue;
                }
                let user_j = embedded[j]
                    .0
                    .props
                    .get("endUserId")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                if user_i != user_j {
                    continue;
                }
                let similarity = cosine_similarity(&embedded[i].1, &embedded[j].1);
                if similarity >= self.config.fusion_threshold
                    && best.map(|(_, s)| similarity > s).unwrap_or(true)
                {
                    best = Some((j, similarity));
                }
            }

            if let Some((j, similarity)) = best {
                taken.insert(embedded[i].0.id.as_str());
                taken.insert(embedded[j].0.id.as_str());
                pairs.push(FusionPair {
                    category,
                    end_user_id: user_i.to_string(),
                    first_id: embedded[i].0.id.clone(),
                    second_id: embedded[j].0.id.clone(),
                    similarity,
                });
            }
        }

        Ok((scanned, pairs))
    }

    /// Fuse one pair, letting the model pick the surviving content
    pub async fn fuse_pair(
        &self,
        pair: &FusionPair,
        memory_config: &MemoryConfig,
    ) -> Result<()> {
        let first_text = self.node_text(pair.category, &pair.first_id)?;
        let second_text = self.node_text(pair.category, &pair.second_id)?;

        match pair.category {
            NodeCategory::Entity => {
                // Entities keep the richer node; content fusion is the alias union
                self.store.merge_entities(
                    &pair.first_id,
                    &pair.second_id,
                    memory_config.access_history_cap,
                )?;
                Ok(())
            }
            NodeCategory::Statement => {
                let decision = self.choose_survivor(&first_text, &second_text, memory_config).await?;
                let (surviving, absorbed) = if decision.keep == "second" {
                    (&pair.second_id, &pair.first_id)
                } else {
                    (&pair.first_id, &pair.second_id)
                };
                self.store.merge_statements(
                    surviving,
                    absorbed,
                    &decision.surviving_content,
                    memory_config.access_history_cap,
                )?;
                Ok(())
            }
            NodeCategory::Summary | NodeCategory::Chunk => {
                // Summaries and chunks keep the first node and drop the twin
                self.store.soft_delete(pair.category, &pair.second_id)?;
                Ok(())
            }
            NodeCategory::Dialogue => Err(MemoryError::InvalidInput(
                "dialogues are never fused".to_string(),
            )),
        }
    }

    async fn choose_survivor(
        &self,
        first: &str,
        second: &str,
        memory_config: &MemoryConfig,
    ) -> Result<FusionDecision> {
        let messages = vec![
            ChatMessage::system(
                "You merge near-duplicate memory records. Given two statements, return JSON \
                 {\"surviving_content\": string, \"keep\": \"first\"|\"second\"} where \
                 surviving_content preserves every distinct fact from both.",
            ),
            ChatMessage::user(format!("First: {first}\nSecond: {second}")),
        ];
        chat_structured::<FusionDecision>(
            self.model.as_ref(),
            &memory_config.llm_model_id,
            &messages,
            &ChatOptions::default(),
        )
        .await
        .map_err(|e| MemoryError::FusionFailed(e.to_string()))
    }

    fn node_text(&self, category: NodeCategory, id: &str) -> Result<String> {
        match category {
            NodeCategory::Statement => Ok(self
                .store
                .get_statement(id)?
                .ok_or_else(|| MemoryError::NotFound(id.to_string()))?
                .statement),
            NodeCategory::Entity => Ok(self
                .store
                .get_entity(id)?
                .ok_or_else(|| MemoryError::NotFound(id.to_string()))?
                .name),
            _ => Ok(String::new()),
        }
    }

    /// Run one full cycle across the knowledge categories plus chunks
    pub async fn run_cycle(
        &self,
        end_user_id: Option<&str>,
        memory_config: &MemoryConfig,
    ) -> Result<ForgettingReport> {
        let mut report = ForgettingReport::default();

        for category in [
            NodeCategory::Statement,
            NodeCategory::Entity,
            NodeCategory::Summary,
            NodeCategory::Chunk,
        ] {
            let (scanned, pairs) = if category == NodeCategory::Chunk {
                // Chunks carry no activation; they are fused only through
                // their embedding twins and are skipped in the scan count
                (0, vec![])
            } else {
                self.candidate_pairs(category, end_user_id, memory_config)?
            };
            report.scanned += scanned;

            for pair in &pairs {
                match self.fuse_pair(pair, memory_config).await {
                    Ok(()) => report.merged += 1,
                    Err(e) => {
                        report.failed += 1;
                        tracing::warn!(
                            category = %pair.category,
                            first = %pair.first_id,
                            second = %pair.second_id,
                            "fusion failed, keeping both: {}",
                            e
                        );
                    }
                }
            }
        }

        tracing::info!(
            scanned = report.scanned,
            merged = report.merged,
            failed = report.failed,
            "forgetting cycle finished"
        );
        Ok(report)
    }
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ============================================================================
// TESTS
// ============================================================================

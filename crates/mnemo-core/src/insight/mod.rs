//! Memory Insight & User Summary
//!
//! Aggregates graph statistics for one end user into LLM prose: a single
//! memory-insight paragraph and a four-part user summary (intro,
//! personality, core values, one sentence). Both are cached on the end-user
//! row; the cache regeneration job refreshes them with per-user error
//! isolation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::MemoryConfig;
use crate::error::Result;
use crate::graph::GraphStore;
use crate::provider::{chat_structured, ChatMessage, ChatOptions, LanguageModel};
use crate::store::RelationalStore;

// ============================================================================
// TYPES
// ============================================================================

/// Aggregates fed into the insight prompt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryAggregates {
    pub total_nodes: i64,
    pub dialogues: i64,
    pub statements: i64,
    pub entities: i64,
    pub summaries: i64,
    /// Statement type distribution, most common first
    pub statement_types: Vec<(String, i64)>,
    /// Most-accessed entity names with their access counts
    pub hot_entities: Vec<(String, i64)>,
}

/// Four-part user summary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub intro: String,
    pub personality: String,
    pub core_values: String,
    pub one_sentence: String,
}

#[derive(Debug, Deserialize)]
struct InsightOut {
    insight: String,
}

/// Per-user outcome counters for a regeneration sweep
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerationReport {
    pub total_users: usize,
    pub successful: usize,
    pub failed: usize,
}

// ============================================================================
// SERVICE
// ============================================================================

/// Insight and summary generation over the graph aggregates
pub struct InsightService {
    store: Arc<GraphStore>,
    relational: Arc<RelationalStore>,
    model: Arc<dyn LanguageModel>,
}

impl InsightService {
    pub fn new(
        store: Arc<GraphStore>,
        relational: Arc<RelationalStore>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            store,
            relational,
            model,
        }
    }

    /// Collect the graph aggregates for one user
    pub fn aggregates(&self, end_user_id: &str) -> Result<MemoryAggregates> {
        let counts = self.store.count_nodes(end_user_id)?;
        Ok(MemoryAggregates {
            total_nodes: counts.total(),
            dialogues: counts.dialogues,
            statements: counts.statements,
            entities: counts.entities,
            summaries: counts.summaries,
            statement_types: self.store.statement_type_counts(end_user_id)?,
            hot_entities: self.store.hot_entities(end_user_id, 10)?,
        })
    }

    /// Generate and cache the memory-insight paragraph
    pub async fn generate_and_cache_insight(
        &self,
        end_user_id: &str,
        config: &MemoryConfig,
    ) -> Result<String> {
        let aggregates = self.aggregates(end_user_id)?;
        let messages = vec![
            ChatMessage::system(
                "You are a memory analyst. Given aggregate statistics of a user's memory graph, \
                 write one natural-language paragraph describing what their memory holds: the \
                 dominant domains, how the memories are distributed over time, and the people or \
                 things they revolve around. Return JSON {\"insight\": string}.",
            ),
            ChatMessage::user(serde_json::to_string(&aggregates)?),
        ];
        let out = chat_structured::<InsightOut>(
            self.model.as_ref(),
            &config.llm_model_id,
            &messages,
            &ChatOptions::default(),
        )
        .await?;

        self.relational.ensure_end_user(end_user_id, None)?;
        self.relational.update_insight(end_user_id, &out.insight)?;
        Ok(out.insight)
    }

    /// Generate and cache the four-part user summary
    pub async fn generate_and_cache_summary(
        &self,
        end_user_id: &str,
        config: &MemoryConfig,
    ) -> Result<UserSummary> {
        let aggregates = self.aggregates(end_user_id)?;
        let messages = vec![
            ChatMessage::system(
                "You profile a user from aggregate statistics of their memory graph. Return \
                 JSON {\"intro\": string, \"personality\": string, \"coreValues\": string, \
                 \"oneSentence\": string}: an introduction paragraph, a personality sketch, \
                 their apparent core values, and a one-sentence portrait.",
            ),
            ChatMessage::user(serde_json::to_string(&aggregates)?),
        ];
        let summary = chat_structured::<UserSummary>(
            self.model.as_ref(),
            &config.llm_model_id,
            &messages,
            &ChatOptions::default(),
        )
        .await?;

        self.relational.ensure_end_user(end_user_id, None)?;
        self.relational.update_summary(
            end_user_id,
            &summary.intro,
            &summary.personality,
            &summary.core_values,
            &summary.one_sentence,
        )?;
        Ok(summary)
    }

    /// Refresh both caches for every user, isolating per-user failures
    pub async fn regenerate_all(
        &self,
        workspace_id: Option<&str>,
        config: &MemoryConfig,
    ) -> Result<RegenerationReport> {
        let users = self.relational.list_end_users(workspace_id)?;
        let mut report = RegenerationReport {
            total_users: users.len(),
            ..Default::default()
        };

        for end_user_id in users {
            let insight = self.generate_and_cache_insight(&end_user_id, config).await;
            let summary = self.generate_and_cache_summary(&end_user_id, config).await;
            match (insight, summary) {
                (Ok(_), Ok(_)) => report.successful += 1,
                (insight, summary) => {
                    report.failed += 1;
                    if let Err(e) = insight {
                        tracing::error!(end_user_id = %end_user_id, "insight regeneration failed: {}", e);
                    }
                    if let Err(e) = summary {
                        tracing::error!(end_user_id = %end_user_id, "summary regeneration failed: {}", e);
                    }
                }
            }
        }

        tracing::info!(
            total = report.total_users,
            successful = report.successful,
            failed = report.failed,
            "insight cache regeneration finished"
        );
        Ok(report)
    }

    /// Workspace memory totals: count every user's nodes and store the sum
    pub fn write_workspace_totals(&self, workspace_id: &str) -> Result<i64> {
        let users = self.relational.list_end_users(Some(workspace_id))?;
        let mut total = 0_i64;
        for end_user_id in &users {
            match self.store.count_nodes(end_user_id) {
                Ok(counts) => total += counts.total(),
                Err(e) => {
                    // One broken user never sinks the sweep
                    tracing::warn!(end_user_id = %end_user_id, "count failed: {}", e);
                }
            }
        }
        self.relational.write_memory_increment(workspace_id, total)?;
        Ok(total)
    }
}

// ============================================================================
// TESTS
// ============================================================================

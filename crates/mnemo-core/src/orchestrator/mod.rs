//! Read Orchestrator
//!
//! Drives the read path: branch on the search switch, optionally classify
//! the message, decompose it into sub-queries, retrieve evidence per
//! sub-query, summarize it into one answer, and persist the short-term
//! memory row. The insufficient-evidence sentinel is returned verbatim and
//! never cached.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::graph::NodeCategory;
use crate::ingestion::TurnMessage;
use crate::provider::{chat_structured, ChatMessage, ChatOptions, LanguageModel};
use crate::retrieval::{HybridRetriever, SearchRequest, SearchType};
use crate::store::{RelationalStore, ShortTermMemoryRecord};

/// Exact sentinel the summarizer returns when evidence is insufficient
pub const INSUFFICIENT_EVIDENCE: &str = "信息不足，无法回答。";

// ============================================================================
// REQUEST / RESULT TYPES
// ============================================================================

/// Read-path branching switch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SearchSwitch {
    /// "0": classify the message, then branch
    #[default]
    #[serde(rename = "0")]
    Classify,
    /// "1": skip classification, retrieve directly
    #[serde(rename = "1")]
    Retrieve,
    /// "2": answer from context only, no retrieval, no short-term memory
    #[serde(rename = "2")]
    ContextOnly,
}

impl SearchSwitch {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "1" => SearchSwitch::Retrieve,
            "2" => SearchSwitch::ContextOnly,
            _ => SearchSwitch::Classify,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchSwitch::Classify => "0",
            SearchSwitch::Retrieve => "1",
            SearchSwitch::ContextOnly => "2",
        }
    }
}

/// Read request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub end_user_id: String,
    pub message: String,
    #[serde(default)]
    pub history: Vec<TurnMessage>,
    #[serde(default)]
    pub search_switch: SearchSwitch,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_id: Option<String>,
}

/// Read result with the evidence trail
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResult {
    pub answer: String,
    pub intermediate_outputs: Vec<serde_json::Value>,
}

/// Message intent as classified on switch "0"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageIntent {
    Read,
    Write,
    ChitChat,
}

#[derive(Debug, Deserialize)]
struct ClassifyOut {
    intent: String,
}

#[derive(Debug, Deserialize)]
struct DecomposeOut {
    #[serde(default)]
    sub_queries: Vec<String>,
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

/// The read path over retriever, model, and relational store
pub struct ReadOrchestrator {
    retriever: Arc<HybridRetriever>,
    model: Arc<dyn LanguageModel>,
    relational: Arc<RelationalStore>,
}

impl ReadOrchestrator {
    pub fn new(
        retriever: Arc<HybridRetriever>,
        model: Arc<dyn LanguageModel>,
        relational: Arc<RelationalStore>,
    ) -> Self {
        Self {
            retriever,
            model,
            relational,
        }
    }

    /// Handle one read request
    pub async fn read(&self, request: &ReadRequest, config: &MemoryConfig) -> Result<ReadResult> {
        if request.message.trim().is_empty() {
            return Err(MemoryError::InvalidInput("message is empty".to_string()));
        }

        match request.search_switch {
            SearchSwitch::ContextOnly => self.answer_from_context(request, config).await,
            SearchSwitch::Retrieve => self.retrieve_and_summarize(request, config, vec![]).await,
            SearchSwitch::Classify => {
                let intent = self.classify_message(&request.message, config).await?;
                let trail = vec![serde_json::json!({
                    "type": "classification",
                    "intent": intent,
                })];
                match intent {
                    MessageIntent::Read => {
                        self.retrieve_and_summarize(request, config, trail).await
                    }
                    MessageIntent::Write | MessageIntent::ChitChat => {
                        // Nothing worth retrieving; reply from context. The
                        // write-path ingestion happens on the queue, not here.
                        let mut result = self.answer_from_context(request, config).await?;
                        let mut outputs = trail;
                        outputs.append(&mut result.intermediate_outputs);
                        result.intermediate_outputs = outputs;
                        self.persist_short_term(request, &result.answer, "");
                        Ok(result)
                    }
                }
            }
        }
    }

    /// Direct answer over the conversation context
    async fn answer_from_context(
        &self,
        request: &ReadRequest,
        config: &MemoryConfig,
    ) -> Result<ReadResult> {
        let mut messages = vec![ChatMessage::system(
            "You are a helpful assistant with long-term memory. Answer the user's message \
             using the conversation context.",
        )];
        for turn in &request.history {
            messages.push(match turn.role.as_str() {
                "assistant" => ChatMessage::assistant(turn.content.clone()),
                _ => ChatMessage::user(turn.content.clone()),
            });
        }
        messages.push(ChatMessage::user(request.message.clone()));

        let outcome = self
            .model
            .chat(&config.llm_model_id, &messages, &ChatOptions::default())
            .await?;

        Ok(ReadResult {
            answer: outcome.content,
            intermediate_outputs: vec![],
        })
    }

    /// Classify the message into read / write / chit-chat
    async fn classify_message(&self, message: &str, config: &MemoryConfig) -> Result<MessageIntent> {
        let messages = vec![
            ChatMessage::system(
                "Classify the user's message. Return JSON {\"intent\": \"read\"|\"write\"|\"chit-chat\"}: \
                 'read' asks about previously stored information, 'write' states new information to \
                 remember, 'chit-chat' is neither.",
            ),
            ChatMessage::user(message.to_string()),
        ];
        let out = chat_structured::<ClassifyOut>(
            self.model.as_ref(),
            &config.llm_model_id,
            &messages,
            &ChatOptions::default(),
        )
        .await;

        Ok(match out {
            Ok(parsed) => match parsed.intent.trim().to_lowercase().as_str() {
                "write" => MessageIntent::Write,
                "chit-chat" | "chitchat" => MessageIntent::ChitChat,
                _ => MessageIntent::Read,
            },
            Err(e) => {
                // An unclassifiable message defaults to the retrieval branch
                tracing::warn!("classification failed, defaulting to read: {}", e);
                MessageIntent::Read
            }
        })
    }

    /// Decompose the message into retrieval sub-queries
    async fn decompose_message(&self, message: &str, config: &MemoryConfig) -> Vec<String> {
        let messages = vec![
            ChatMessage::system(
                "Split the user's question into independent retrieval sub-queries. Return \
                 JSON {\"sub_queries\": [string, ...]}. A simple question yields one sub-query.",
            ),
            ChatMessage::user(message.to_string()),
        ];
        match chat_structured::<DecomposeOut>(
            self.model.as_ref(),
            &config.llm_model_id,
            &messages,
            &ChatOptions::default(),
        )
        .await
        {
            Ok(out) if !out.sub_queries.is_empty() => out
                .sub_queries
                .into_iter()
                .filter(|q| !q.trim().is_empty())
                .collect(),
            _ => vec![message.to_string()],
        }
    }

    async fn retrieve_and_summarize(
        &self,
        request: &ReadRequest,
        config: &MemoryConfig,
        mut trail: Vec<serde_json::Value>,
    ) -> Result<ReadResult> {
        let sub_queries = self.decompose_message(&request.message, config).await;
        trail.push(serde_json::json!({
            "type": "sub_queries",
            "queries": sub_queries,
        }));

        let mut evidence_blocks: Vec<String> = Vec::new();
        let mut retrieved_pairs: Vec<(String, Vec<String>)> = Vec::new();

        for sub_query in &sub_queries {
            let search_request = SearchRequest {
                end_user_id: request.end_user_id.clone(),
                query_text: sub_query.clone(),
                search_type: SearchType::Hybrid,
                include: vec![],
                limit: 10,
                rerank_alpha: None,
                activation_boost_factor: None,
                use_forgetting_rerank: false,
            };
            let response = self.retriever.search(&search_request, config).await?;

            let mut statements: Vec<String> = Vec::new();
            let mut summaries: Vec<String> = Vec::new();
            if let Some(reranked) = &response.reranked_results {
                if let Some(items) = reranked.get(&NodeCategory::Statement) {
                    statements.extend(items.iter().filter_map(|i| {
                        i.props.get("statement").and_then(|v| v.as_str()).map(String::from)
                    }));
                }
                if let Some(items) = reranked.get(&NodeCategory::Summary) {
                    summaries.extend(items.iter().filter_map(|i| {
                        i.props.get("content").and_then(|v| v.as_str()).map(String::from)
                    }));
                }
            }

            trail.push(serde_json::json!({
                "type": "search_result",
                "query": sub_query,
                "statements": statements,
                "summaries": summaries,
                "combinedSummary": response.combined_summary,
            }));

            if !statements.is_empty() || !summaries.is_empty() {
                let mut block = format!("Sub-query: {sub_query}\n");
                for statement in &statements {
                    block.push_str(&format!("- {statement}\n"));
                }
                for summary in &summaries {
                    block.push_str(&format!("* {summary}\n"));
                }
                evidence_blocks.push(block);
            }

            let mut deduped = statements;
            deduped.sort();
            deduped.dedup();
            retrieved_pairs.push((sub_query.clone(), deduped));
        }

        let answer = self
            .summarize_evidence(&request.message, &evidence_blocks, config)
            .await?;

        // Cache the answer unless evidence was insufficient
        if answer.trim() != INSUFFICIENT_EVIDENCE {
            let retrieved_content = serde_json::to_string(
                &retrieved_pairs
                    .iter()
                    .filter(|(_, statements)| !statements.is_empty())
                    .map(|(query, statements)| {
                        let mut entry = serde_json::Map::new();
                        entry.insert(query.clone(), serde_json::json!(statements));
                        serde_json::Value::Object(entry)
                    })
                    .collect::<Vec<_>>(),
            )
            .unwrap_or_else(|_| "[]".to_string());
            self.persist_short_term(request, &answer, &retrieved_content);
        }

        Ok(ReadResult {
            answer,
            intermediate_outputs: trail,
        })
    }

    /// Retrieve-Summary prompt: evidence in, one answer (or the sentinel) out
    async fn summarize_evidence(
        &self,
        message: &str,
        evidence_blocks: &[String],
        config: &MemoryConfig,
    ) -> Result<String> {
        if evidence_blocks.is_empty() {
            return Ok(INSUFFICIENT_EVIDENCE.to_string());
        }

        let messages = vec![
            ChatMessage::system(format!(
                "Answer the user's question strictly from the retrieved memory evidence below. \
                 If the evidence is insufficient to answer, reply with exactly: {INSUFFICIENT_EVIDENCE}"
            )),
            ChatMessage::user(format!(
                "Question: {message}\n\nEvidence:\n{}",
                evidence_blocks.join("\n")
            )),
        ];
        let outcome = self
            .model
            .chat(&config.llm_model_id, &messages, &ChatOptions::default())
            .await?;
        Ok(outcome.content)
    }

    /// Short-term memory upsert; failure never breaks the read path
    fn persist_short_term(&self, request: &ReadRequest, answer: &str, retrieved_content: &str) {
        if request.search_switch == SearchSwitch::ContextOnly {
            return;
        }
        if answer.trim() == INSUFFICIENT_EVIDENCE {
            return;
        }
        let record = ShortTermMemoryRecord {
            end_user_id: request.end_user_id.clone(),
            message: request.message.clone(),
            answer: answer.to_string(),
            retrieved_content: retrieved_content.to_string(),
            search_switch: request.search_switch.as_str().to_string(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.relational.upsert_short_term_memory(&record) {
            tracing::error!("failed to save short-term memory: {}", e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_switch_parsing() {
        assert_eq!(SearchSwitch::parse("0"), SearchSwitch::Classify);
        assert_eq!(SearchSwitch::parse("1"), SearchSwitch::Retrieve);
        assert_eq!(SearchSwitch::parse("2"), SearchSwitch::ContextOnly);
        assert_eq!(SearchSwitch::parse(" 2 "), SearchSwitch::ContextOnly);
        assert_eq!(SearchSwitch::parse("garbage"), SearchSwitch::Classify);
    }

    #[test]
    fn test_search_switch_serde_uses_wire_strings() {
        let json = serde_json::to_string(&SearchSwitch::ContextOnly).unwrap();
        assert_eq!(json, "\"2\"");
        let parsed: SearchSwitch = serde_json::from_str("\"1\"").unwrap();
        assert_eq!(parsed, SearchSwitch::Retrieve);
    }

    #[test]
    fn test_sentinel_is_verbatim() {
        assert_eq!(INSUFFICIENT_EVIDENCE, "信息不足，无法回答。");
    }
}

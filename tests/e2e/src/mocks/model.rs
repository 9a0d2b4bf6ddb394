//! Mock Language Model
//!
//! Deterministic provider double: embeddings are derived from token hashes
//! (identical text -> identical vector, shared tokens -> higher cosine), and
//! chat replies are popped from a script queue. An empty script falls back
//! to echoing the last user message, which keeps incidental calls harmless.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use mnemo_core::{ChatMessage, ChatOptions, ChatOutcome, LanguageModel, Result, TokenUsage};

/// Dimensionality of mock embeddings
pub const MOCK_DIMENSIONS: usize = 16;

/// Scripted mock provider
#[derive(Default)]
pub struct MockModel {
    replies: Mutex<VecDeque<String>>,
    /// Every chat prompt seen, for assertions
    pub seen_prompts: Mutex<Vec<String>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one reply; replies pop in FIFO order per chat call
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap().push_back(reply.into());
    }

    fn next_reply(&self, messages: &[ChatMessage]) -> String {
        if let Some(reply) = self.replies.lock().unwrap().pop_front() {
            return reply;
        }
        messages
            .iter()
            .rev()
            .find_map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

/// Token-hash embedding: shared words move vectors closer
pub fn mock_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0_f32; MOCK_DIMENSIONS];
    for token in text.to_lowercase().split_whitespace() {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        let bucket = (hasher.finish() % MOCK_DIMENSIONS as u64) as usize;
        vector[bucket] += 1.0;
    }
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

/// A canned extraction reply for one statement + one entity + a summary
pub fn extraction_reply(statement: &str, entity: &str, summary: &str) -> String {
    serde_json::json!({
        "statements": [{
            "statement": statement,
            "stmt_type": "FACT",
            "temporal_info": "DYNAMIC",
            "importance_score": 0.7
        }],
        "entities": [{
            "name": entity,
            "entity_type": "topic",
            "description": format!("mentioned in: {statement}"),
            "aliases": [],
            "statement_indices": [0]
        }],
        "summary": summary
    })
    .to_string()
}

#[async_trait]
impl LanguageModel for MockModel {
    async fn embed(&self, _model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| mock_embedding(t)).collect())
    }

    async fn chat(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _opts: &ChatOptions,
    ) -> Result<ChatOutcome> {
        if let Some(prompt) = messages.iter().rev().find_map(|m| m.content.clone()) {
            self.seen_prompts.lock().unwrap().push(prompt);
        }
        Ok(ChatOutcome {
            content: self.next_reply(messages),
            tool_calls: vec![],
            finish_reason: "stop".to_string(),
            token_usage: Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        })
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: &ChatOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome> {
        let outcome = self.chat(model, messages, opts).await?;
        for chunk in outcome.content.chars() {
            let _ = tx.send(chunk.to_string()).await;
        }
        Ok(outcome)
    }
}

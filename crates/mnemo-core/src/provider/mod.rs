//! Provider Abstraction
//!
//! One narrow interface per capability: `embed`, `chat` (optionally
//! streaming, optionally schema-constrained), and `rerank` (optional,
//! identity by default). Providers differ only in the wire shape of
//! multimodal content parts, which is isolated in [`content`].

pub mod content;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{MemoryError, Result};

// ============================================================================
// CHAT MESSAGE TYPES
// ============================================================================

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    /// Provider-shaped media parts for multimodal turns; text-only messages
    /// leave this empty and send a plain string on the wire.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media_parts: Vec<serde_json::Value>,
    /// Tool calls requested by the assistant (assistant messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// When role == Tool, identifies which tool call this result is for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: Some(content.into()),
            media_parts: vec![],
            tool_calls: vec![],
            tool_call_id: None,
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: Some(content.into()),
            media_parts: vec![],
            tool_calls: vec![],
            tool_call_id: None,
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: Some(content.into()),
            media_parts: vec![],
            tool_calls: vec![],
            tool_call_id: None,
        }
    }
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: None,
            media_parts: vec![],
            tool_calls,
            tool_call_id: None,
        }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            media_parts: vec![],
            tool_calls: vec![],
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_tool_call_type")]
    pub r#type: String,
    pub function: ToolCallFunction,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

/// The function name and arguments within a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Arguments as parsed JSON, normalized for downstream consumers.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool parameters
    pub parameters: serde_json::Value,
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Options for a chat call.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// Ask the provider for a JSON object response
    pub json_mode: bool,
    pub tools: Vec<ToolSpec>,
}

/// Response from a chat call.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    /// Text content (may be empty if tool_calls present)
    pub content: String,
    /// Tool calls the model wants to make
    pub tool_calls: Vec<ToolCall>,
    /// Finish reason: "stop", "tool_calls", "length", ...
    pub finish_reason: String,
    pub token_usage: Option<TokenUsage>,
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// Supported provider families
///
/// The family affects only how multimodal content parts are shaped on the
/// wire; everything else speaks the OpenAI-compatible surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Bedrock,
    DashScope,
    Ollama,
    Xinference,
    GpuStack,
}

/// Provider-agnostic language model interface
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Embed a batch of texts; one vector per text, fixed dimensionality per
    /// model.
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Non-streaming chat completion.
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome>;

    /// Streaming chat completion; text deltas are forwarded through `tx` as
    /// they arrive, the full outcome is returned at the end.
    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: &ChatOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome>;

    /// Optional cross-encoder reranking; the default returns identity scores
    /// so callers can treat rerank as always available.
    async fn rerank(
        &self,
        _model: &str,
        _query: &str,
        candidates: &[String],
    ) -> Result<Vec<f64>> {
        Ok(vec![1.0; candidates.len()])
    }
}

/// Stricter system prompt injected on the structured-output retry
const STRICT_JSON_PROMPT: &str = "You must respond with a single valid JSON object and nothing \
     else. No prose, no markdown fences, no explanations. The object must match the requested \
     schema exactly.";

/// Call the model expecting a JSON value matching `T`
///
/// On a parse failure the call is retried once with a stricter system
/// prompt; a second failure surfaces as `LlmParseError`.
pub async fn chat_structured<T: DeserializeOwned>(
    model: &dyn LanguageModel,
    model_ref: &str,
    messages: &[ChatMessage],
    opts: &ChatOptions,
) -> Result<T> {
    let mut opts = opts.clone();
    opts.json_mode = true;

    let first = model.chat(model_ref, messages, &opts).await?;
    match parse_json_content::<T>(&first.content) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            tracing::debug!("structured parse failed, retrying with stricter prompt: {first_err}");
            let mut retry_messages = Vec::with_capacity(messages.len() + 1);
            retry_messages.push(ChatMessage::system(STRICT_JSON_PROMPT));
            retry_messages.extend_from_slice(messages);

            let second = model.chat(model_ref, &retry_messages, &opts).await?;
            parse_json_content::<T>(&second.content)
                .map_err(|e| MemoryError::LlmParseError(e.to_string()))
        }
    }
}

/// Parse a JSON value out of model output, tolerating markdown fences
pub fn parse_json_content<T: DeserializeOwned>(content: &str) -> serde_json::Result<T> {
    let trimmed = content.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.strip_suffix("```").unwrap_or(s))
        .unwrap_or(trimmed)
        .trim();

    match serde_json::from_str(stripped) {
        Ok(value) => Ok(value),
        Err(err) => {
            // Fall back to the outermost JSON object embedded in prose
            if let (Some(start), Some(end)) = (stripped.find('{'), stripped.rfind('}')) {
                if start < end {
                    return serde_json::from_str(&stripped[start..=end]);
                }
            }
            Err(err)
        }
    }
}

// ============================================================================
// HTTP PROVIDER (OPENAI-COMPATIBLE WIRE)
// ============================================================================

/// HTTP provider speaking the OpenAI-compatible API surface
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    kind: ProviderKind,
}

impl HttpProvider {
    pub fn new(
        kind: ProviderKind,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MemoryError::Init(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            kind,
        })
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }

    fn chat_body(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: &ChatOptions,
        stream: bool,
    ) -> serde_json::Value {
        let wire_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| content::message_to_wire(self.kind, m))
            .collect();

        let mut body = json!({
            "model": model,
            "messages": wire_messages,
        });
        if let Some(temperature) = opts.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = opts.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if opts.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        if !opts.tools.is_empty() {
            body["tools"] = json!(opts
                .tools
                .iter()
                .map(|t| json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                }))
                .collect::<Vec<_>>());
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }
}

fn parse_tool_calls(value: &serde_json::Value) -> Vec<ToolCall> {
    value
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let function = call.get("function")?;
                    let arguments = match function.get("arguments") {
                        // OpenAI sends arguments as a JSON string
                        Some(serde_json::Value::String(s)) => {
                            serde_json::from_str(s).unwrap_or(json!({}))
                        }
                        Some(v) => v.clone(),
                        None => json!({}),
                    };
                    Some(ToolCall {
                        id: call
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        r#type: "function".to_string(),
                        function: ToolCallFunction {
                            name: function.get("name")?.as_str()?.to_string(),
                            arguments,
                        },
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl LanguageModel for HttpProvider {
    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let body = json!({ "model": model, "input": texts });
        let response = self
            .request("/embeddings")
            .json(&body)
            .send()
            .await
            .map_err(|e| MemoryError::EmbeddingFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MemoryError::EmbeddingFailed(format!(
                "provider returned {}",
                response.status()
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MemoryError::EmbeddingFailed(e.to_string()))?;

        let vectors: Vec<Vec<f32>> = payload
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| MemoryError::EmbeddingFailed("missing data array".to_string()))?
            .iter()
            .map(|item| {
                item.get("embedding")
                    .and_then(|e| e.as_array())
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(|v| v.as_f64())
                            .map(|v| v as f32)
                            .collect()
                    })
                    .ok_or_else(|| MemoryError::EmbeddingFailed("missing embedding".to_string()))
            })
            .collect::<Result<_>>()?;

        if vectors.len() != texts.len() {
            return Err(MemoryError::EmbeddingFailed(format!(
                "expected {} vectors, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<ChatOutcome> {
        let body = self.chat_body(model, messages, opts, false);
        let response = self
            .request("/chat/completions")
            .json(&body)
            .send()
            .await
            .map_err(|e| MemoryError::LlmCallFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MemoryError::LlmCallFailed(format!(
                "provider returned {}",
                response.status()
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| MemoryError::LlmCallFailed(e.to_string()))?;

        let choice = payload
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| MemoryError::LlmCallFailed("no choices in response".to_string()))?;
        let message = choice
            .get("message")
            .ok_or_else(|| MemoryError::LlmCallFailed("no message in choice".to_string()))?;

        Ok(ChatOutcome {
            content: message
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string(),
            tool_calls: parse_tool_calls(message),
            finish_reason: choice
                .get("finish_reason")
                .and_then(|f| f.as_str())
                .unwrap_or("stop")
                .to_string(),
            token_usage: payload
                .get("usage")
                .and_then(|u| serde_json::from_value(u.clone()).ok()),
        })
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: &ChatOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome> {
        let body = self.chat_body(model, messages, opts, true);
        let response = self
            .request("/chat/completions")
            .json(&body)
            .send()
            .await
            .map_err(|e| MemoryError::LlmCallFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MemoryError::LlmCallFailed(format!(
                "provider returned {}",
                response.status()
            )));
        }

        let mut full_content = String::new();
        let mut finish_reason = "stop".to_string();
        let mut token_usage = None;
        let mut buffer = String::new();

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| MemoryError::LlmCallFailed(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE frames are newline-delimited "data: {...}" lines
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);

                let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                    continue;
                };
                if data == "[DONE]" {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else {
                    continue;
                };
                if let Some(usage) = event.get("usage") {
                    token_usage = serde_json::from_value(usage.clone()).ok();
                }
                let Some(choice) = event.get("choices").and_then(|c| c.get(0)) else {
                    continue;
                };
                if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
                    finish_reason = reason.to_string();
                }
                if let Some(delta) = choice
                    .get("delta")
                    .and_then(|d| d.get("content"))
                    .and_then(|c| c.as_str())
                {
                    if !delta.is_empty() {
                        full_content.push_str(delta);
                        if tx.send(delta.to_string()).await.is_err() {
                            // Receiver gone; finish the request quietly
                            tracing::debug!("stream receiver dropped, discarding tail");
                        }
                    }
                }
            }
        }

        Ok(ChatOutcome {
            content: full_content,
            tool_calls: vec![],
            finish_reason,
            token_usage,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_content_plain() {
        #[derive(Deserialize)]
        struct Out {
            answer: String,
        }
        let parsed: Out = parse_json_content(r#"{"answer": "42"}"#).unwrap();
        assert_eq!(parsed.answer, "42");
    }

    #[test]
    fn test_parse_json_content_fenced() {
        #[derive(Deserialize)]
        struct Out {
            answer: String,
        }
        let parsed: Out = parse_json_content("```json\n{\"answer\": \"yes\"}\n```").unwrap();
        assert_eq!(parsed.answer, "yes");
    }

    #[test]
    fn test_parse_json_content_embedded_in_prose() {
        #[derive(Deserialize)]
        struct Out {
            n: i64,
        }
        let parsed: Out = parse_json_content("Sure! Here you go: {\"n\": 3} Hope that helps.").unwrap();
        assert_eq!(parsed.n, 3);
    }

    #[test]
    fn test_parse_json_content_rejects_garbage() {
        let parsed: serde_json::Result<serde_json::Value> = parse_json_content("not json at all");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_parse_tool_calls_string_arguments() {
        let message = json!({
            "tool_calls": [{
                "id": "call_1",
                "function": {"name": "search", "arguments": "{\"q\": \"rust\"}"}
            }]
        });
        let calls = parse_tool_calls(&message);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "search");
        assert_eq!(calls[0].function.arguments["q"], "rust");
    }

    #[test]
    fn test_token_usage_aggregation() {
        let mut total = TokenUsage::default();
        total.add(&TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        total.add(&TokenUsage {
            prompt_tokens: 1,
            completion_tokens: 2,
            total_tokens: 3,
        });
        assert_eq!(total.total_tokens, 18);
    }
}

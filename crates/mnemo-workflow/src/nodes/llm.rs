//! LLM Node
//!
//! Renders its prompt templates against the pool and calls the provider,
//! optionally streaming tokens and optionally looping over tool calls. Two
//! stop conditions bound the tool loop: an iteration budget (configured or
//! auto-computed from the tool count) and a consecutive-call limit per tool
//! that substitutes a synthetic give-up result instead of invoking again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use mnemo_core::{
    ChatMessage, ChatOptions, ChatOutcome, LanguageModel, MemoryConfig, TokenUsage, ToolSpec,
};

use crate::error::{Result, WorkflowError};
use crate::pool::VariablePool;
use crate::template::render_template;

/// Friendly message reported when the iteration budget runs out
const ITERATION_BUDGET_MESSAGE: &str =
    "I could not finish the requested tool workflow within the allowed number of steps. \
     Here is what I have so far; please retry or narrow the request.";

/// Synthetic tool result after too many consecutive calls to one tool
const GIVE_UP_TOOL_RESULT: &str =
    "This tool has been called too many times in a row. Stop calling it and answer with the \
     information already gathered.";

/// A tool callable from LLM nodes
#[async_trait]
pub trait WorkflowTool: Send + Sync {
    /// Definition offered to the model
    fn spec(&self) -> ToolSpec;
    /// Invoke with parsed arguments
    async fn invoke(&self, arguments: Value) -> Result<String>;
}

/// Tools available to an execution, by name
pub type ToolRegistry = HashMap<String, Arc<dyn WorkflowTool>>;

/// LLM node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Model reference; falls back to the memory config's chat model
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    /// Names resolved against the execution's tool registry
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub streaming: bool,
    /// Explicit iteration budget; absent means auto-computed
    #[serde(default)]
    pub max_iterations: Option<usize>,
}

impl LlmConfig {
    /// Iteration budget: configured, or `base + per_tool * tool_count`
    pub fn iteration_budget(&self, config: &MemoryConfig) -> usize {
        self.max_iterations.unwrap_or(
            config.auto_max_iterations_base
                + config.auto_max_iterations_per_tool * self.tools.len(),
        )
    }
}

/// Result of one LLM node run
#[derive(Debug, Clone)]
pub struct LlmRunResult {
    pub output: String,
    pub token_usage: Option<TokenUsage>,
}

/// Execute the node
///
/// `chunk_tx` carries streamed text deltas when streaming is enabled and no
/// tools are attached; tool runs are always non-streaming.
pub async fn run_llm_node(
    node_id: &str,
    config: &LlmConfig,
    memory_config: &MemoryConfig,
    model: &dyn LanguageModel,
    tools: &ToolRegistry,
    pool: &VariablePool,
    chunk_tx: Option<mpsc::Sender<String>>,
) -> Result<LlmRunResult> {
    let model_ref = config
        .model_id
        .clone()
        .unwrap_or_else(|| memory_config.llm_model_id.clone());

    let mut messages = Vec::new();
    if let Some(system_prompt) = &config.system_prompt {
        messages.push(ChatMessage::system(render_template(system_prompt, pool, false)?));
    }
    messages.push(ChatMessage::user(render_template(&config.user_prompt, pool, false)?));

    let mut opts = ChatOptions {
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        ..Default::default()
    };

    if config.tools.is_empty() {
        let outcome = if let Some(tx) = chunk_tx.filter(|_| config.streaming) {
            model.chat_stream(&model_ref, &messages, &opts, tx).await?
        } else {
            model.chat(&model_ref, &messages, &opts).await?
        };
        return Ok(LlmRunResult {
            output: outcome.content,
            token_usage: outcome.token_usage,
        });
    }

    // Resolve tool specs; an unknown name is a configuration error
    let mut resolved: Vec<(String, Arc<dyn WorkflowTool>)> = Vec::new();
    for name in &config.tools {
        let tool = tools.get(name).ok_or_else(|| WorkflowError::InvalidNode {
            node_id: node_id.to_string(),
            reason: format!("unknown tool '{name}'"),
        })?;
        resolved.push((name.clone(), tool.clone()));
    }
    opts.tools = resolved.iter().map(|(_, t)| t.spec()).collect();

    let budget = config.iteration_budget(memory_config);
    let mut total_usage = TokenUsage::default();
    let mut saw_usage = false;
    let mut last_tool: Option<String> = None;
    let mut consecutive = 0_usize;

    for _ in 0..budget {
        let outcome: ChatOutcome = model.chat(&model_ref, &messages, &opts).await?;
        if let Some(usage) = &outcome.token_usage {
            total_usage.add(usage);
            saw_usage = true;
        }

        if outcome.tool_calls.is_empty() {
            return Ok(LlmRunResult {
                output: outcome.content,
                token_usage: saw_usage.then_some(total_usage),
            });
        }

        messages.push(ChatMessage::assistant_tool_calls(outcome.tool_calls.clone()));
        for call in &outcome.tool_calls {
            let name = call.function.name.clone();
            if last_tool.as_deref() == Some(name.as_str()) {
                consecutive += 1;
            } else {
                last_tool = Some(name.clone());
                consecutive = 1;
            }

            let result = if consecutive >= memory_config.max_tool_consecutive_calls {
                tracing::warn!(
                    node_id = %node_id,
                    tool = %name,
                    "consecutive tool-call limit reached, substituting give-up result"
                );
                GIVE_UP_TOOL_RESULT.to_string()
            } else {
                match tools.get(&name) {
                    Some(tool) => match tool.invoke(call.function.arguments.clone()).await {
                        Ok(result) => result,
                        Err(e) => format!("Tool '{name}' failed: {e}"),
                    },
                    None => format!("Tool '{name}' is not available."),
                }
            };
            let call_id = if call.id.is_empty() {
                // Some providers omit call ids; synthesize one for pairing
                format!("call-{}", uuid::Uuid::new_v4().simple())
            } else {
                call.id.clone()
            };
            messages.push(ChatMessage::tool_result(call_id, result));
        }
    }

    // The budget ran out: report a friendly message, not an error
    tracing::warn!(node_id = %node_id, budget, "LLM node hit its iteration budget");
    Ok(LlmRunResult {
        output: ITERATION_BUDGET_MESSAGE.to_string(),
        token_usage: saw_usage.then_some(total_usage),
    })
}

/// Wire-shape helper for the node's declared input (audit trail)
pub fn llm_input_value(config: &LlmConfig, pool: &VariablePool) -> Value {
    json!({
        "userPrompt": render_template(&config.user_prompt, pool, false).unwrap_or_default(),
        "tools": config.tools.clone(),
        "streaming": config.streaming,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted model: pops one canned outcome per chat call
    struct ScriptedModel {
        outcomes: Mutex<Vec<ChatOutcome>>,
        calls: Mutex<usize>,
    }

    impl ScriptedModel {
        fn new(mut outcomes: Vec<ChatOutcome>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn embed(&self, _model: &str, texts: &[String]) -> mnemo_core::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }

        async fn chat(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _opts: &ChatOptions,
        ) -> mnemo_core::Result<ChatOutcome> {
            *self.calls.lock().unwrap() += 1;
            Ok(self
                .outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| ChatOutcome {
                    content: "done".to_string(),
                    ..Default::default()
                }))
        }

        async fn chat_stream(
            &self,
            model: &str,
            messages: &[ChatMessage],
            opts: &ChatOptions,
            tx: mpsc::Sender<String>,
        ) -> mnemo_core::Result<ChatOutcome> {
            let outcome = self.chat(model, messages, opts).await?;
            for chunk in outcome.content.chars() {
                let _ = tx.send(chunk.to_string()).await;
            }
            Ok(outcome)
        }
    }

    struct EchoTool;

    #[async_trait]
    impl WorkflowTool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "echo back".to_string(),
                parameters: json!({"type": "object"}),
            }
        }

        async fn invoke(&self, arguments: Value) -> Result<String> {
            Ok(arguments.to_string())
        }
    }

    fn tool_call(name: &str) -> mnemo_core::ToolCall {
        mnemo_core::ToolCall {
            id: "c1".to_string(),
            r#type: "function".to_string(),
            function: mnemo_core::ToolCallFunction {
                name: name.to_string(),
                arguments: json!({}),
            },
        }
    }

    #[test]
    fn test_iteration_budget_auto_computed() {
        let memory_config = MemoryConfig::default();
        let config = LlmConfig {
            tools: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        // base 5 + 2 per tool * 2 tools
        assert_eq!(config.iteration_budget(&memory_config), 9);

        let pinned = LlmConfig {
            max_iterations: Some(3),
            ..config
        };
        assert_eq!(pinned.iteration_budget(&memory_config), 3);
    }

    #[tokio::test]
    async fn test_plain_completion() {
        let model = ScriptedModel::new(vec![ChatOutcome {
            content: "the answer".to_string(),
            ..Default::default()
        }]);
        let config = LlmConfig {
            user_prompt: "question".to_string(),
            ..Default::default()
        };
        let result = run_llm_node(
            "llm1",
            &config,
            &MemoryConfig::default(),
            &model,
            &ToolRegistry::new(),
            &VariablePool::new(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(result.output, "the answer");
    }

    #[tokio::test]
    async fn test_tool_loop_resolves_then_answers() {
        let model = ScriptedModel::new(vec![
            ChatOutcome {
                tool_calls: vec![tool_call("echo")],
                finish_reason: "tool_calls".to_string(),
                ..Default::default()
            },
            ChatOutcome {
                content: "final answer".to_string(),
                ..Default::default()
            },
        ]);
        let mut tools = ToolRegistry::new();
        tools.insert("echo".to_string(), Arc::new(EchoTool));
        let config = LlmConfig {
            user_prompt: "use the tool".to_string(),
            tools: vec!["echo".to_string()],
            ..Default::default()
        };
        let result = run_llm_node(
            "llm1",
            &config,
            &MemoryConfig::default(),
            &model,
            &tools,
            &VariablePool::new(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(result.output, "final answer");
    }

    #[tokio::test]
    async fn test_iteration_budget_yields_friendly_message() {
        // The model insists on calling the tool forever
        let outcomes: Vec<ChatOutcome> = (0..20)
            .map(|_| ChatOutcome {
                tool_calls: vec![tool_call("echo")],
                finish_reason: "tool_calls".to_string(),
                ..Default::default()
            })
            .collect();
        let model = ScriptedModel::new(outcomes);
        let mut tools = ToolRegistry::new();
        tools.insert("echo".to_string(), Arc::new(EchoTool));
        let config = LlmConfig {
            user_prompt: "loop".to_string(),
            tools: vec!["echo".to_string()],
            max_iterations: Some(3),
            ..Default::default()
        };
        let result = run_llm_node(
            "llm1",
            &config,
            &MemoryConfig::default(),
            &model,
            &tools,
            &VariablePool::new(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(result.output, ITERATION_BUDGET_MESSAGE);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_config_error() {
        let model = ScriptedModel::new(vec![]);
        let config = LlmConfig {
            user_prompt: "x".to_string(),
            tools: vec!["missing".to_string()],
            ..Default::default()
        };
        let result = run_llm_node(
            "llm1",
            &config,
            &MemoryConfig::default(),
            &model,
            &ToolRegistry::new(),
            &VariablePool::new(),
            None,
        )
        .await;
        assert!(matches!(result, Err(WorkflowError::InvalidNode { .. })));
    }

    #[tokio::test]
    async fn test_streaming_forwards_chunks() {
        let model = ScriptedModel::new(vec![ChatOutcome {
            content: "abc".to_string(),
            ..Default::default()
        }]);
        let config = LlmConfig {
            user_prompt: "stream".to_string(),
            streaming: true,
            ..Default::default()
        };
        let (tx, mut rx) = mpsc::channel(16);
        let result = run_llm_node(
            "llm1",
            &config,
            &MemoryConfig::default(),
            &model,
            &ToolRegistry::new(),
            &VariablePool::new(),
            Some(tx),
        )
        .await
        .unwrap();
        assert_eq!(result.output, "abc");

        let mut streamed = String::new();
        while let Ok(chunk) = rx.try_recv() {
            streamed.push_str(&chunk);
        }
        assert_eq!(streamed, "abc");
    }
}

//! Workflow Executor
//!
//! Runs a resolved graph: nodes execute in topological order under an
//! activation map (branch nodes activate exactly one successor), each node
//! is bounded by a soft timeout and wrapped into a standard outcome, and
//! failures follow the node's error edge when one exists. End nodes assemble
//! their declared segments into the streamed response; segment order is
//! preserved regardless of which upstream node finishes first.
//!
//! Conversation continuity: when a prior execution of the same conversation
//! completed, its `conv.*` variables and message list seed this one. State
//! is checkpointed per `execution_id` on completion and on failure.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use mnemo_core::{LanguageModel, MemoryConfig, RelationalStore, TokenUsage, WorkflowExecutionRecord};

use crate::error::{Result, WorkflowError};
use crate::expression::Case;
use crate::graph::WorkflowGraph;
use crate::nodes::{
    apply_assignment, run_classifier_node, run_code_node, run_llm_node, LoopConfig, Node, NodeKind,
    NodeOutcome, ToolRegistry, WorkflowConfig,
};
use crate::pool::{VariablePool, NS_CONV, NS_SYS};
use crate::stream::{EndStreamState, WorkflowEvent};
use crate::template::render_template;
use crate::variable::VariableType;

// ============================================================================
// INPUT / OUTPUT
// ============================================================================

/// Input of one workflow run
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunInput {
    #[serde(default)]
    pub app_id: Option<String>,
    pub message: String,
    /// Custom variables exposed as `sys.input_variables`
    #[serde(default)]
    pub variables: Value,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub files: Vec<Value>,
    pub workspace_id: String,
}

/// Final result of one workflow run
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunOutput {
    pub status: String,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    pub node_outputs: Value,
    pub messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub conv_variables: Value,
}

/// Cooperative cancellation flag shared with a running execution
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ============================================================================
// EXECUTOR
// ============================================================================

/// Executes one workflow graph
pub struct WorkflowExecutor {
    graph: WorkflowGraph,
    model: Arc<dyn LanguageModel>,
    tools: ToolRegistry,
    memory_config: MemoryConfig,
    /// Checkpoint store; absent means no persistence (tests, dry runs)
    relational: Option<Arc<RelationalStore>>,
    node_timeout: Duration,
    execution_id: String,
}

impl WorkflowExecutor {
    pub fn new(
        config: WorkflowConfig,
        model: Arc<dyn LanguageModel>,
        memory_config: MemoryConfig,
    ) -> Result<Self> {
        Ok(Self {
            graph: WorkflowGraph::build(config)?,
            model,
            tools: ToolRegistry::new(),
            memory_config,
            relational: None,
            node_timeout: Duration::from_secs(120),
            execution_id: Uuid::new_v4().to_string(),
        })
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_checkpoints(mut self, relational: Arc<RelationalStore>) -> Self {
        self.relational = Some(relational);
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Run to completion, discarding the event stream
    pub async fn execute(&self, input: WorkflowRunInput) -> Result<WorkflowRunOutput> {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        self.run_internal(input, tx, CancelToken::new()).await
    }

    /// Run with a live event stream (public and internal events)
    ///
    /// The returned receiver yields events as they happen; filter with
    /// [`WorkflowEvent::is_public`] for public consumers. The run output is
    /// carried by the final `end` event and the join handle.
    pub fn execute_stream(
        self: Arc<Self>,
        input: WorkflowRunInput,
        cancel: CancelToken,
    ) -> (
        mpsc::UnboundedReceiver<WorkflowEvent>,
        tokio::task::JoinHandle<Result<WorkflowRunOutput>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move { self.run_internal(input, tx, cancel).await });
        (rx, handle)
    }

    // ========================================================================
    // ENGINE
    // ========================================================================

    async fn run_internal(
        &self,
        input: WorkflowRunInput,
        tx: mpsc::UnboundedSender<WorkflowEvent>,
        cancel: CancelToken,
    ) -> Result<WorkflowRunOutput> {
        let started = Instant::now();
        let _ = tx.send(WorkflowEvent::Start {
            execution_id: self.execution_id.clone(),
            conversation_id: input.conversation_id.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        });

        let mut pool = VariablePool::new();
        let mut messages: Vec<Value> = Vec::new();
        self.init_pool(&mut pool, &input, &mut messages)?;

        let mut end_states: HashMap<String, EndStreamState> = HashMap::new();
        for node in &self.graph.nodes {
            if let NodeKind::End(config) = &node.kind {
                end_states.insert(node.id.clone(), EndStreamState::new(&node.id, config.segments()));
            }
        }

        let mut activation: HashMap<String, bool> = HashMap::new();
        activation.insert(self.graph.start_node_id.clone(), true);
        let mut completed: HashSet<String> = HashSet::new();
        let mut node_outputs = serde_json::Map::new();
        let mut total_usage = TokenUsage::default();
        let mut saw_usage = false;
        let mut final_output = String::new();

        let node_ids: Vec<String> = self.graph.nodes.iter().map(|n| n.id.clone()).collect();
        for node_id in node_ids {
            if cancel.is_canceled() {
                let reason = "execution canceled".to_string();
                let _ = tx.send(WorkflowEvent::Error { reason: reason.clone() });
                self.checkpoint(&input, &pool, &messages, "canceled", None, Some(&reason), started);
                return Err(WorkflowError::Canceled(reason));
            }

            let node = self.graph.node(&node_id).expect("node from graph order").clone();
            if !activation.get(&node.id).copied().unwrap_or(false) {
                continue;
            }
            let _ = tx.send(WorkflowEvent::NodeStart {
                node_id: node.id.clone(),
            });

            let node_started = Instant::now();
            let run = tokio::time::timeout(
                self.node_timeout,
                self.run_node(&node, &mut pool, &mut end_states, &completed, &tx),
            )
            .await;

            let elapsed = node_started.elapsed().as_secs_f64();
            let outcome = match run {
                Ok(Ok(mut outcome)) => {
                    outcome.elapsed_time = elapsed;
                    outcome
                }
                Ok(Err(e)) => {
                    match self.handle_node_failure(&node, e.to_string(), elapsed, &mut activation, &tx) {
                        Ok(outcome) => outcome,
                        Err(abort) => {
                            self.checkpoint(
                                &input,
                                &pool,
                                &messages,
                                "failed",
                                None,
                                Some(&abort.to_string()),
                                started,
                            );
                            let _ = tx.send(WorkflowEvent::Error {
                                reason: abort.to_string(),
                            });
                            return Err(abort);
                        }
                    }
                }
                Err(_) => {
                    let timeout = WorkflowError::NodeTimeout(
                        node.id.clone(),
                        self.node_timeout.as_secs(),
                    );
                    match self.handle_node_failure(
                        &node,
                        timeout.to_string(),
                        elapsed,
                        &mut activation,
                        &tx,
                    ) {
                        Ok(outcome) => outcome,
                        Err(abort) => {
                            self.checkpoint(
                                &input,
                                &pool,
                                &messages,
                                "failed",
                                None,
                                Some(&abort.to_string()),
                                started,
                            );
                            let _ = tx.send(WorkflowEvent::Error {
                                reason: abort.to_string(),
                            });
                            return Err(abort);
                        }
                    }
                }
            };

            if outcome.status == "completed" {
                if let Some(usage) = &outcome.token_usage {
                    total_usage.add(usage);
                    saw_usage = true;
                }
                let _ = tx.send(WorkflowEvent::NodeEnd {
                    node_id: node.id.clone(),
                    output: outcome.output.clone(),
                    elapsed_time: outcome.elapsed_time,
                    token_usage: outcome.token_usage,
                });
                completed.insert(node.id.clone());

                // End nodes contribute their assembled text to the response
                if let NodeKind::End(_) = &node.kind {
                    if let Some(state) = end_states.get(&node.id) {
                        final_output.push_str(&state.emitted);
                    }
                }

                // Activation propagation: branch nodes pick one edge
                if node.kind.is_branch() {
                    let chosen = outcome.branch.clone().unwrap_or_default();
                    for edge in self.graph.successors(&node.id) {
                        if edge.branch.as_deref() == Some(chosen.as_str()) {
                            activation.insert(edge.target.clone(), true);
                        }
                    }
                } else {
                    for edge in self.graph.successors(&node.id) {
                        activation.insert(edge.target.clone(), true);
                    }
                }
            }

            node_outputs.insert(node.id.clone(), serde_json::to_value(&outcome)?);
        }

        let elapsed_time = started.elapsed().as_secs_f64();
        messages.push(json!({"role": "user", "content": input.message.clone()}));
        messages.push(json!({"role": "assistant", "content": final_output.clone()}));

        let output = WorkflowRunOutput {
            status: "completed".to_string(),
            output: final_output.clone(),
            error: None,
            elapsed_time,
            token_usage: saw_usage.then_some(total_usage),
            node_outputs: Value::Object(node_outputs),
            messages: messages.clone(),
            conversation_id: input.conversation_id.clone(),
            conv_variables: Value::Object(pool.namespace_values(NS_CONV).into_iter().collect()),
        };

        self.checkpoint(
            &input,
            &pool,
            &messages,
            "completed",
            Some(&final_output),
            None,
            started,
        );
        let _ = tx.send(WorkflowEvent::End {
            output: final_output,
            status: "completed".to_string(),
            error: None,
            elapsed_time,
            token_usage: output.token_usage,
        });

        tracing::info!(
            execution_id = %self.execution_id,
            elapsed_time,
            "workflow execution completed"
        );
        Ok(output)
    }

    /// Route a failure through the error edge, or abort
    fn handle_node_failure(
        &self,
        node: &Node,
        error: String,
        elapsed: f64,
        activation: &mut HashMap<String, bool>,
        tx: &mpsc::UnboundedSender<WorkflowEvent>,
    ) -> Result<NodeOutcome> {
        let _ = tx.send(WorkflowEvent::NodeError {
            node_id: node.id.clone(),
            error: error.clone(),
            elapsed_time: elapsed,
        });

        if let Some(edge) = self.graph.error_edge(&node.id) {
            tracing::warn!(
                node_id = %node.id,
                target = %edge.target,
                "node failed, following error edge: {}",
                error
            );
            activation.insert(edge.target.clone(), true);
            return Ok(NodeOutcome::failed(node, json!({}), error, elapsed));
        }

        Err(WorkflowError::NodeFailed {
            node_id: node.id.clone(),
            reason: error,
        })
    }

    /// Seed sys/conv variables and restore conversation continuity
    fn init_pool(
        &self,
        pool: &mut VariablePool,
        input: &WorkflowRunInput,
        messages: &mut Vec<Value>,
    ) -> Result<()> {
        for var in &self.graph.variables {
            let ty = VariableType::parse_name(&var.var_type).ok_or_else(|| {
                WorkflowError::InvalidWorkflow(format!(
                    "conversation variable '{}' has unknown type '{}'",
                    var.name, var.var_type
                ))
            })?;
            let value = var.default.clone().unwrap_or_else(|| ty.default_value());
            pool.declare(NS_CONV, &var.name, value, ty, true)?;
        }

        // Continuity: a completed prior execution of this conversation seeds
        // conv variables and the message history
        if let (Some(conversation_id), Some(relational)) =
            (&input.conversation_id, &self.relational)
        {
            if let Ok(Some(prior)) = relational.latest_completed_execution(conversation_id) {
                pool.restore_conversation(&prior.conv_variables);
                if let Some(prior_messages) = prior.messages.as_array() {
                    messages.extend(prior_messages.iter().cloned());
                }
            }
        }

        let sys_vars: [(&str, Value, VariableType); 7] = [
            ("message", json!(input.message), VariableType::String),
            (
                "conversation_id",
                json!(input.conversation_id.clone().unwrap_or_default()),
                VariableType::String,
            ),
            ("execution_id", json!(self.execution_id), VariableType::String),
            ("workspace_id", json!(input.workspace_id), VariableType::String),
            ("user_id", json!(input.user_id), VariableType::String),
            (
                "input_variables",
                if input.variables.is_object() {
                    input.variables.clone()
                } else {
                    json!({})
                },
                VariableType::Object,
            ),
            ("files", json!(input.files), VariableType::ArrayFile),
        ];
        for (key, value, ty) in sys_vars {
            pool.declare(NS_SYS, key, value, ty, false)?;
        }
        Ok(())
    }

    // ========================================================================
    // NODE DISPATCH
    // ========================================================================

    async fn run_node(
        &self,
        node: &Node,
        pool: &mut VariablePool,
        end_states: &mut HashMap<String, EndStreamState>,
        completed: &HashSet<String>,
        tx: &mpsc::UnboundedSender<WorkflowEvent>,
    ) -> Result<NodeOutcome> {
        match &node.kind {
            NodeKind::Llm(config) if config.streaming && config.tools.is_empty() => {
                self.run_streaming_llm(node, config.clone(), pool, end_states, completed, tx)
                    .await
            }
            NodeKind::End(_) => self.run_end_node(node, pool, end_states, completed, tx),
            NodeKind::Loop(config) | NodeKind::Iteration(config) => {
                let config = config.clone();
                self.run_loop_node(node, &config, pool, tx).await
            }
            _ => self.run_simple_node(node, pool, tx).await,
        }
    }

    /// Nodes with no streaming or subgraph concerns
    async fn run_simple_node(
        &self,
        node: &Node,
        pool: &mut VariablePool,
        tx: &mpsc::UnboundedSender<WorkflowEvent>,
    ) -> Result<NodeOutcome> {
        match &node.kind {
            NodeKind::Start => Ok(NodeOutcome::completed(node, json!({}), None, 0.0)),
            NodeKind::Llm(config) => {
                let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(64);
                let forward_tx = tx.clone();
                let node_id = node.id.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(chunk) = chunk_rx.recv().await {
                        let _ = forward_tx.send(WorkflowEvent::NodeChunk {
                            node_id: node_id.clone(),
                            chunk,
                            done: false,
                        });
                    }
                });
                let result = run_llm_node(
                    &node.id,
                    config,
                    &self.memory_config,
                    self.model.as_ref(),
                    &self.tools,
                    pool,
                    Some(chunk_tx),
                )
                .await?;
                let _ = forwarder.await;

                let output_value = json!(result.output);
                pool.declare(&node.id, "output", output_value.clone(), VariableType::String, false)?;
                let mut outcome = NodeOutcome::completed(
                    node,
                    crate::nodes::llm_input_value(config, pool),
                    Some(output_value),
                    0.0,
                );
                outcome.token_usage = result.token_usage;
                Ok(outcome)
            }
            NodeKind::IfElse(config) => {
                let branch = evaluate_cases(&config.cases, pool)?;
                pool.declare(&node.id, "output", json!(branch.clone()), VariableType::String, false)?;
                let mut outcome = NodeOutcome::completed(
                    node,
                    json!({"cases": config.cases.len()}),
                    Some(json!(branch.clone())),
                    0.0,
                );
                outcome.branch = Some(branch);
                Ok(outcome)
            }
            NodeKind::Assigner(config) => {
                for assignment in &config.assignments {
                    apply_assignment(assignment, pool)?;
                }
                Ok(NodeOutcome::completed(
                    node,
                    json!({"assignments": config.assignments.len()}),
                    None,
                    0.0,
                ))
            }
            NodeKind::JinjaRender(config) => {
                let rendered = json!(render_jinja(&node.id, config, pool)?);
                pool.declare(&node.id, "output", rendered.clone(), VariableType::String, false)?;
                Ok(NodeOutcome::completed(
                    node,
                    json!({"template": config.template.clone()}),
                    Some(rendered),
                    0.0,
                ))
            }
            NodeKind::QuestionClassifier(config) => {
                let classification = run_classifier_node(
                    &node.id,
                    config,
                    &self.memory_config,
                    self.model.as_ref(),
                    pool,
                )
                .await?;
                let class_name = classification.class_name.clone();
                let case = classification.output.clone();
                pool.declare(
                    &node.id,
                    "class_name",
                    json!(class_name),
                    VariableType::String,
                    false,
                )?;
                pool.declare(&node.id, "output", json!(case.clone()), VariableType::String, false)?;
                let mut outcome = NodeOutcome::completed(
                    node,
                    json!({"inputVariable": config.input_variable.clone()}),
                    Some(json!({
                        "class_name": classification.class_name,
                        "output": classification.output,
                    })),
                    0.0,
                );
                outcome.branch = Some(case);
                outcome.token_usage = classification.token_usage;
                Ok(outcome)
            }
            NodeKind::Code(config) => {
                let value = run_code_node(&node.id, config, pool)?;
                pool.declare(&node.id, "output", value.clone(), config.output_type(), false)?;
                Ok(NodeOutcome::completed(
                    node,
                    json!({"expression": config.expression.clone()}),
                    Some(value),
                    0.0,
                ))
            }
            NodeKind::End(_) | NodeKind::Loop(_) | NodeKind::Iteration(_) => {
                unreachable!("handled by run_node dispatch")
            }
        }
    }

    /// Streaming LLM node with live End-segment forwarding
    async fn run_streaming_llm(
        &self,
        node: &Node,
        config: crate::nodes::LlmConfig,
        pool: &mut VariablePool,
        end_states: &mut HashMap<String, EndStreamState>,
        completed: &HashSet<String>,
        tx: &mpsc::UnboundedSender<WorkflowEvent>,
    ) -> Result<NodeOutcome> {
        // Pick the End node this stream may feed live: a branch-free path
        // guarantees it runs, and its cursor must reach a segment depending
        // on this node after the pending literals drain
        let mut live_end: Option<String> = None;
        for end_id in &self.graph.end_node_ids {
            if !self
                .graph
                .streamable_pairs
                .contains(&(node.id.clone(), end_id.clone()))
            {
                continue;
            }
            let Some(state) = end_states.get_mut(end_id) else {
                continue;
            };
            if state.finished() {
                continue;
            }
            state.active = true;
            let chunks = state.drain_ready(pool, &|n| completed.contains(n), false)?;
            for chunk in chunks {
                let _ = tx.send(WorkflowEvent::Message { chunk });
            }
            let at_dependent = state
                .segments
                .get(state.cursor)
                .map(|segment| segment.depends_on() == Some(node.id.as_str()))
                .unwrap_or(false);
            if at_dependent {
                state.streaming_from = Some(node.id.clone());
                live_end = Some(end_id.clone());
                break;
            }
        }

        // Render prompts now; the provider call runs detached
        let model_ref = config
            .model_id
            .clone()
            .unwrap_or_else(|| self.memory_config.llm_model_id.clone());
        let mut chat_messages = Vec::new();
        if let Some(system_prompt) = &config.system_prompt {
            chat_messages.push(mnemo_core::ChatMessage::system(render_template(
                system_prompt,
                pool,
                false,
            )?));
        }
        chat_messages.push(mnemo_core::ChatMessage::user(render_template(
            &config.user_prompt,
            pool,
            false,
        )?));
        let opts = mnemo_core::ChatOptions {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            ..Default::default()
        };

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(64);
        let model = self.model.clone();
        let call = tokio::spawn(async move {
            model.chat_stream(&model_ref, &chat_messages, &opts, chunk_tx).await
        });

        while let Some(chunk) = chunk_rx.recv().await {
            let _ = tx.send(WorkflowEvent::NodeChunk {
                node_id: node.id.clone(),
                chunk: chunk.clone(),
                done: false,
            });
            if let Some(end_id) = &live_end {
                if let Some(state) = end_states.get_mut(end_id) {
                    state.record_streamed(&chunk);
                    let _ = tx.send(WorkflowEvent::Message { chunk });
                }
            }
        }

        let outcome = call
            .await
            .map_err(|e| WorkflowError::NodeFailed {
                node_id: node.id.clone(),
                reason: format!("stream task panicked: {e}"),
            })??;
        let _ = tx.send(WorkflowEvent::NodeChunk {
            node_id: node.id.clone(),
            chunk: String::new(),
            done: true,
        });

        // The streamed segment is finished; move the cursor past it
        if let Some(end_id) = &live_end {
            if let Some(state) = end_states.get_mut(end_id) {
                state.advance();
            }
        }

        let output_value = json!(outcome.content);
        pool.declare(&node.id, "output", output_value.clone(), VariableType::String, false)?;
        let mut node_outcome = NodeOutcome::completed(
            node,
            crate::nodes::llm_input_value(&config, pool),
            Some(output_value),
            0.0,
        );
        node_outcome.token_usage = outcome.token_usage;
        Ok(node_outcome)
    }

    /// End node: assemble and emit every remaining segment
    fn run_end_node(
        &self,
        node: &Node,
        pool: &mut VariablePool,
        end_states: &mut HashMap<String, EndStreamState>,
        completed: &HashSet<String>,
        tx: &mpsc::UnboundedSender<WorkflowEvent>,
    ) -> Result<NodeOutcome> {
        let state = end_states
            .get_mut(&node.id)
            .expect("end state exists for every end node");
        state.active = true;

        // Every dependency of an executing End node has completed; force
        // renders segments whose producer sat on an unactivated branch empty
        let chunks = state.drain_ready(pool, &|n| completed.contains(n), true)?;
        for chunk in chunks {
            let _ = tx.send(WorkflowEvent::Message { chunk });
        }

        let output_value = json!(state.emitted.clone());
        pool.declare(&node.id, "output", output_value.clone(), VariableType::String, false)?;
        Ok(NodeOutcome::completed(
            node,
            json!({"segments": state.segments.len()}),
            Some(output_value),
            0.0,
        ))
    }

    /// Loop / iteration node: run the body subgraph per iteration
    async fn run_loop_node(
        &self,
        node: &Node,
        config: &LoopConfig,
        pool: &mut VariablePool,
        tx: &mpsc::UnboundedSender<WorkflowEvent>,
    ) -> Result<NodeOutcome> {
        let body_nodes: Vec<Node> = config
            .body
            .nodes
            .iter()
            .map(Node::parse)
            .collect::<Result<_>>()?;
        let body_order = body_topological_order(&body_nodes, &config.body.edges)?;

        let items: Option<Vec<Value>> = match &config.collection {
            Some(selector) => {
                let value = pool.get_value(selector, None, true)?;
                Some(value.as_array().cloned().ok_or_else(|| {
                    WorkflowError::InvalidNode {
                        node_id: node.id.clone(),
                        reason: format!("collection '{selector}' is not an array"),
                    }
                })?)
            }
            None => None,
        };

        let iteration_count = items
            .as_ref()
            .map(|i| i.len())
            .unwrap_or(config.max_loops)
            .min(config.max_loops);

        let mut iteration_outputs: Vec<Value> = Vec::new();
        for index in 0..iteration_count {
            pool.declare(&node.id, "index", json!(index), VariableType::Number, false)?;
            let item = items
                .as_ref()
                .and_then(|items| items.get(index))
                .cloned()
                .unwrap_or(Value::Null);
            pool.declare(&node.id, "item", json!({"value": item}), VariableType::Object, false)?;

            let mut last_output = Value::Null;
            for &body_index in &body_order {
                let body_node = &body_nodes[body_index];
                let outcome =
                    Box::pin(self.run_simple_or_loop(body_node, pool, tx)).await?;
                if let Some(output) = outcome.output {
                    last_output = output;
                }
            }
            iteration_outputs.push(json!({"index": index, "output": last_output}));

            if let Some(exit) = &config.exit_condition {
                if exit.evaluate(pool)? {
                    break;
                }
            }
        }

        let iterations = iteration_outputs.len();
        let outputs_value = json!(iteration_outputs);
        pool.declare(
            &node.id,
            "output",
            outputs_value.clone(),
            VariableType::ArrayObject,
            false,
        )?;
        Ok(NodeOutcome::completed(
            node,
            json!({"iterations": iterations}),
            Some(outputs_value),
            0.0,
        ))
    }

    /// Body nodes support every kind except start/end
    async fn run_simple_or_loop(
        &self,
        node: &Node,
        pool: &mut VariablePool,
        tx: &mpsc::UnboundedSender<WorkflowEvent>,
    ) -> Result<NodeOutcome> {
        match &node.kind {
            NodeKind::Start | NodeKind::End(_) => Err(WorkflowError::InvalidNode {
                node_id: node.id.clone(),
                reason: "start/end nodes are not allowed inside loop bodies".to_string(),
            }),
            NodeKind::Loop(config) | NodeKind::Iteration(config) => {
                let config = config.clone();
                self.run_loop_node(node, &config, pool, tx).await
            }
            _ => self.run_simple_node(node, pool, tx).await,
        }
    }

    /// Persist the execution checkpoint; failure is logged, never raised
    #[allow(clippy::too_many_arguments)]
    fn checkpoint(
        &self,
        input: &WorkflowRunInput,
        pool: &VariablePool,
        messages: &[Value],
        status: &str,
        output: Option<&str>,
        error: Option<&str>,
        started: Instant,
    ) {
        let Some(relational) = &self.relational else {
            return;
        };
        let record = WorkflowExecutionRecord {
            execution_id: self.execution_id.clone(),
            conversation_id: input.conversation_id.clone(),
            app_id: input.app_id.clone(),
            status: status.to_string(),
            conv_variables: Value::Object(pool.namespace_values(NS_CONV).into_iter().collect()),
            messages: Value::Array(messages.to_vec()),
            output: output.map(String::from),
            error: error.map(String::from),
            elapsed_seconds: Some(started.elapsed().as_secs_f64()),
        };
        if let Err(e) = relational.save_workflow_execution(&record) {
            tracing::error!(execution_id = %self.execution_id, "checkpoint failed: {}", e);
        }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Evaluate if-else cases in order; the first true case wins, otherwise the
/// default branch `CASE{n+1}`
fn evaluate_cases(cases: &[Case], pool: &VariablePool) -> Result<String> {
    for (index, case) in cases.iter().enumerate() {
        if case.evaluate(pool)? {
            return Ok(format!("CASE{}", index + 1));
        }
    }
    Ok(format!("CASE{}", cases.len() + 1))
}

/// Render a jinja node's template with its variable mapping
fn render_jinja(
    node_id: &str,
    config: &crate::nodes::JinjaConfig,
    pool: &VariablePool,
) -> Result<String> {
    let env = minijinja::Environment::new();
    let mut context = serde_json::Map::new();
    for mapping in &config.mapping {
        match pool.get(&mapping.value) {
            Some(value) => {
                context.insert(mapping.name.clone(), value.clone());
            }
            None if config.strict => {
                return Err(WorkflowError::UnknownVariable(mapping.value.clone()));
            }
            // Missing + non-strict: leave the name undefined so template
            // defaults like `default('x')` apply and bare uses render empty
            None => {}
        }
    }
    env.render_str(
        &config.template,
        minijinja::Value::from_serialize(&Value::Object(context)),
    )
    .map_err(|e| WorkflowError::InvalidNode {
        node_id: node_id.to_string(),
        reason: format!("template render failed: {e}"),
    })
}

/// Topological order for loop bodies; roots run first
fn body_topological_order(nodes: &[Node], edges: &[crate::nodes::EdgeSpec]) -> Result<Vec<usize>> {
    let by_id: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();
    let mut indegree = vec![0_usize; nodes.len()];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for edge in edges {
        let (Some(&source), Some(&target)) =
            (by_id.get(edge.source.as_str()), by_id.get(edge.target.as_str()))
        else {
            return Err(WorkflowError::InvalidWorkflow(format!(
                "loop body edge references unknown node '{}' -> '{}'",
                edge.source, edge.target
            )));
        };
        outgoing[source].push(target);
        indegree[target] += 1;
    }

    let mut ready: std::collections::VecDeque<usize> =
        (0..nodes.len()).filter(|i| indegree[*i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(current) = ready.pop_front() {
        order.push(current);
        for &next in &outgoing[current] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }
    if order.len() != nodes.len() {
        return Err(WorkflowError::InvalidWorkflow(
            "loop body contains a cycle".to_string(),
        ));
    }
    Ok(order)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::NodeSpec;
    use async_trait::async_trait;
    use mnemo_core::{ChatMessage, ChatOptions, ChatOutcome};
    use std::sync::Mutex;

    /// Scripted model: replies are popped per chat call; streams split the
    /// reply into the configured chunk sizes
    struct ScriptedModel {
        replies: Mutex<Vec<String>>,
        chunk_sizes: Vec<usize>,
    }

    impl ScriptedModel {
        fn new(replies: Vec<&str>) -> Self {
            let mut replies: Vec<String> = replies.into_iter().map(String::from).collect();
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                chunk_sizes: vec![1, 1, 3],
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
            let content = self.replies.lock().unwrap().pop().unwrap_or_default();
            Ok(ChatOutcome {
                content,
                ..Default::default()
            })
        }

        async fn chat_stream(
            &self,
            model: &str,
            messages: &[ChatMessage],
            opts: &ChatOptions,
            tx: mpsc::Sender<String>,
        ) -> mnemo_core::Result<ChatOutcome> {
            let outcome = self.chat(model, messages, opts).await?;
            let mut rest = outcome.content.as_str();
            for size in &self.chunk_sizes {
                if rest.is_empty() {
                    break;
                }
                let take = (*size).min(rest.len());
                let _ = tx.send(rest[..take].to_string()).await;
                rest = &rest[take..];
            }
            if !rest.is_empty() {
                let _ = tx.send(rest.to_string()).await;
            }
            Ok(outcome)
        }
    }

    fn spec(id: &str, node_type: &str, config: Value) -> NodeSpec {
        NodeSpec {
            id: id.to_string(),
            node_type: node_type.to_string(),
            name: None,
            config,
        }
    }

    fn edge(source: &str, target: &str) -> crate::nodes::EdgeSpec {
        crate::nodes::EdgeSpec {
            source: source.to_string(),
            target: target.to_string(),
            edge_type: String::new(),
            branch: None,
        }
    }

    fn branch_edge(source: &str, target: &str, branch: &str) -> crate::nodes::EdgeSpec {
        crate::nodes::EdgeSpec {
            source: source.to_string(),
            target: target.to_string(),
            edge_type: String::new(),
            branch: Some(branch.to_string()),
        }
    }

    fn input(message: &str) -> WorkflowRunInput {
        WorkflowRunInput {
            message: message.to_string(),
            user_id: "u1".to_string(),
            workspace_id: "w1".to_string(),
            ..Default::default()
        }
    }

    fn executor(config: WorkflowConfig, model: ScriptedModel) -> WorkflowExecutor {
        WorkflowExecutor::new(config, Arc::new(model), MemoryConfig::default()).unwrap()
    }

    // End segments ["Hello, ", {llm1.output}, "!"] with llm1
    // streaming "world" in chunks "w", "o", "rld" must yield message events
    // "Hello, ", "w", "o", "rld", "!" in order, and end.output equal to the
    // concatenation
    #[tokio::test]
    async fn test_end_node_streaming_order() {
        let config = WorkflowConfig {
            nodes: vec![
                spec("start", "start", json!({})),
                spec(
                    "llm1",
                    "llm",
                    json!({"user_prompt": "{{sys.message}}", "streaming": true}),
                ),
                spec(
                    "end",
                    "end",
                    json!({"outputs": ["Hello, ", "{{llm1.output}}", "!"]}),
                ),
            ],
            edges: vec![edge("start", "llm1"), edge("llm1", "end")],
            variables: vec![],
        };
        let executor = Arc::new(executor(config, ScriptedModel::new(vec!["world"])));
        let (mut rx, handle) =
            executor.execute_stream(input("greet"), CancelToken::new());

        let mut message_chunks = Vec::new();
        while let Some(event) = rx.recv().await {
            if let WorkflowEvent::Message { chunk } = event {
                message_chunks.push(chunk);
            }
        }
        let output = handle.await.unwrap().unwrap();

        assert_eq!(message_chunks, vec!["Hello, ", "w", "o", "rld", "!"]);
        assert_eq!(output.output, "Hello, world!");
        // Property: the concatenated message events equal the end output
        assert_eq!(message_chunks.concat(), output.output);
    }

    // conv.test = 15 with a single gt-10 case routes CASE1
    #[tokio::test]
    async fn test_ifelse_branch_routing() {
        let config = WorkflowConfig {
            nodes: vec![
                spec("start", "start", json!({})),
                spec(
                    "branch",
                    "if-else",
                    json!({"cases": [{
                        "logical_operator": "and",
                        "expressions": [{
                            "left": "{{conv.test}}",
                            "operator": "gt",
                            "right": 10,
                            "input_type": "constant"
                        }]
                    }]}),
                ),
                spec("end_hit", "end", json!({"outputs": ["high"]})),
                spec("end_miss", "end", json!({"outputs": ["low"]})),
            ],
            edges: vec![
                edge("start", "branch"),
                branch_edge("branch", "end_hit", "CASE1"),
                branch_edge("branch", "end_miss", "CASE2"),
            ],
            variables: vec![crate::nodes::ConvVarSpec {
                name: "test".to_string(),
                var_type: "number".to_string(),
                default: Some(json!(15)),
            }],
        };
        let executor = executor(config, ScriptedModel::new(vec![]));
        let output = executor.execute(input("x")).await.unwrap();

        assert_eq!(output.output, "high");
        let branch_outcome = &output.node_outputs["branch"];
        assert_eq!(branch_outcome["output"], "CASE1");
        // The untaken end never ran
        assert!(output.node_outputs.get("end_miss").is_none());
    }

    #[tokio::test]
    async fn test_ifelse_default_case_when_no_case_matches() {
        let config = WorkflowConfig {
            nodes: vec![
                spec("start", "start", json!({})),
                spec(
                    "branch",
                    "if-else",
                    json!({"cases": [{
                        "logical_operator": "and",
                        "expressions": [{
                            "left": "{{conv.test}}",
                            "operator": "gt",
                            "right": 100,
                            "input_type": "constant"
                        }]
                    }]}),
                ),
                spec("end_default", "end", json!({"outputs": ["default"]})),
            ],
            edges: vec![
                edge("start", "branch"),
                branch_edge("branch", "end_default", "CASE2"),
            ],
            variables: vec![crate::nodes::ConvVarSpec {
                name: "test".to_string(),
                var_type: "number".to_string(),
                default: Some(json!(1)),
            }],
        };
        let executor = executor(config, ScriptedModel::new(vec![]));
        let output = executor.execute(input("x")).await.unwrap();
        assert_eq!(output.output, "default");
    }

    #[tokio::test]
    async fn test_assigner_mutates_conv_variables() {
        let config = WorkflowConfig {
            nodes: vec![
                spec("start", "start", json!({})),
                spec(
                    "assign",
                    "assigner",
                    json!({"assignments": [{
                        "variable_selector": "{{conv.test}}",
                        "operation": "append",
                        "value": 3
                    }]}),
                ),
                spec("end", "end", json!({"outputs": ["{{conv.test}}"]})),
            ],
            edges: vec![edge("start", "assign"), edge("assign", "end")],
            variables: vec![crate::nodes::ConvVarSpec {
                name: "test".to_string(),
                var_type: "array_number".to_string(),
                default: Some(json!([1, 2])),
            }],
        };
        let executor = executor(config, ScriptedModel::new(vec![]));
        let output = executor.execute(input("x")).await.unwrap();
        assert_eq!(output.conv_variables["test"], json!([1, 2, 3]));
        assert_eq!(output.output, "[1,2,3]");
    }

    #[tokio::test]
    async fn test_error_edge_redirects_failure() {
        // The jinja node references a missing strict variable and fails; the
        // error edge routes to a fallback end
        let config = WorkflowConfig {
            nodes: vec![
                spec("start", "start", json!({})),
                spec(
                    "render",
                    "jinja-render",
                    json!({
                        "template": "{{ missing }}",
                        "mapping": [{"name": "missing", "value": "conv.ghost"}],
                        "strict": true
                    }),
                ),
                spec("end_ok", "end", json!({"outputs": ["{{render.output}}"]})),
                spec("end_err", "end", json!({"outputs": ["fallback"]})),
            ],
            edges: vec![
                edge("start", "render"),
                edge("render", "end_ok"),
                crate::nodes::EdgeSpec {
                    source: "render".to_string(),
                    target: "end_err".to_string(),
                    edge_type: "error".to_string(),
                    branch: None,
                },
            ],
            variables: vec![],
        };
        let executor = executor(config, ScriptedModel::new(vec![]));
        let output = executor.execute(input("x")).await.unwrap();
        assert_eq!(output.output, "fallback");
        assert_eq!(output.node_outputs["render"]["status"], "failed");
    }

    #[tokio::test]
    async fn test_failure_without_error_edge_aborts() {
        let config = WorkflowConfig {
            nodes: vec![
                spec("start", "start", json!({})),
                spec(
                    "render",
                    "jinja-render",
                    json!({
                        "template": "{{ missing }}",
                        "mapping": [{"name": "missing", "value": "conv.ghost"}],
                        "strict": true
                    }),
                ),
                spec("end", "end", json!({"outputs": ["never"]})),
            ],
            edges: vec![edge("start", "render"), edge("render", "end")],
            variables: vec![],
        };
        let executor = executor(config, ScriptedModel::new(vec![]));
        let result = executor.execute(input("x")).await;
        assert!(matches!(result, Err(WorkflowError::NodeFailed { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_stops_launching_nodes() {
        let config = WorkflowConfig {
            nodes: vec![
                spec("start", "start", json!({})),
                spec("llm1", "llm", json!({"user_prompt": "p"})),
                spec("end", "end", json!({"outputs": ["{{llm1.output}}"]})),
            ],
            edges: vec![edge("start", "llm1"), edge("llm1", "end")],
            variables: vec![],
        };
        let executor = Arc::new(executor(config, ScriptedModel::new(vec!["x"])));
        let cancel = CancelToken::new();
        cancel.cancel();
        let (mut rx, handle) = executor.execute_stream(input("x"), cancel);

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(WorkflowError::Canceled(_))));

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, WorkflowEvent::Error { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_conversation_continuity_restores_conv_vars() {
        let relational = Arc::new(RelationalStore::new(None).unwrap());
        let config = WorkflowConfig {
            nodes: vec![
                spec("start", "start", json!({})),
                spec(
                    "assign",
                    "assigner",
                    json!({"assignments": [{
                        "variable_selector": "{{conv.counter}}",
                        "operation": "add",
                        "value": 1
                    }]}),
                ),
                spec("end", "end", json!({"outputs": ["{{conv.counter}}"]})),
            ],
            edges: vec![edge("start", "assign"), edge("assign", "end")],
            variables: vec![crate::nodes::ConvVarSpec {
                name: "counter".to_string(),
                var_type: "number".to_string(),
                default: Some(json!(0)),
            }],
        };

        let mut run_input = input("first");
        run_input.conversation_id = Some("c1".to_string());

        let first = WorkflowExecutor::new(
            config.clone(),
            Arc::new(ScriptedModel::new(vec![])),
            MemoryConfig::default(),
        )
        .unwrap()
        .with_checkpoints(relational.clone());
        let output = first.execute(run_input.clone()).await.unwrap();
        assert_eq!(output.output, "1");

        // A second execution of the same conversation picks up the counter
        let second = WorkflowExecutor::new(
            config,
            Arc::new(ScriptedModel::new(vec![])),
            MemoryConfig::default(),
        )
        .unwrap()
        .with_checkpoints(relational.clone());
        let output = second.execute(run_input).await.unwrap();
        assert_eq!(output.output, "2");
        // Message history accumulated across executions
        assert!(output.messages.len() >= 4);
    }

    #[tokio::test]
    async fn test_classifier_routes_branch() {
        let config = WorkflowConfig {
            nodes: vec![
                spec("start", "start", json!({})),
                spec(
                    "classify",
                    "question-classifier",
                    json!({
                        "input_variable": "{{sys.message}}",
                        "categories": [
                            {"class_name": "产品咨询"},
                            {"class_name": "售后服务"}
                        ]
                    }),
                ),
                spec("end_product", "end", json!({"outputs": ["product"]})),
                spec("end_support", "end", json!({"outputs": ["support"]})),
            ],
            edges: vec![
                edge("start", "classify"),
                branch_edge("classify", "end_product", "CASE1"),
                branch_edge("classify", "end_support", "CASE2"),
            ],
            variables: vec![],
        };
        let executor = executor(config, ScriptedModel::new(vec!["产品咨询"]));
        let output = executor.execute(input("我想买一台笔记本电脑")).await.unwrap();

        assert_eq!(output.node_outputs["classify"]["output"]["class_name"], "产品咨询");
        assert_eq!(output.node_outputs["classify"]["output"]["output"], "CASE1");
        assert_eq!(output.output, "product");
    }

    #[tokio::test]
    async fn test_loop_over_collection() {
        let config = WorkflowConfig {
            nodes: vec![
                spec("start", "start", json!({})),
                spec(
                    "looper",
                    "loop",
                    json!({
                        "collection": "conv.items",
                        "max_loops": 10,
                        "body": {
                            "nodes": [{
                                "id": "step",
                                "type": "code",
                                "config": {"expression": "looper.index", "output_type": "number"}
                            }],
                            "edges": []
                        }
                    }),
                ),
                spec("end", "end", json!({"outputs": ["done"]})),
            ],
            edges: vec![edge("start", "looper"), edge("looper", "end")],
            variables: vec![crate::nodes::ConvVarSpec {
                name: "items".to_string(),
                var_type: "array_string".to_string(),
                default: Some(json!(["a", "b", "c"])),
            }],
        };
        let executor = executor(config, ScriptedModel::new(vec![]));
        let output = executor.execute(input("x")).await.unwrap();

        let iterations = output.node_outputs["looper"]["output"].as_array().unwrap();
        assert_eq!(iterations.len(), 3);
        assert_eq!(iterations[2]["output"], json!(2));
    }

    #[tokio::test]
    async fn test_public_event_filter() {
        let config = WorkflowConfig {
            nodes: vec![
                spec("start", "start", json!({})),
                spec("llm1", "llm", json!({"user_prompt": "p", "streaming": true})),
                spec("end", "end", json!({"outputs": ["{{llm1.output}}"]})),
            ],
            edges: vec![edge("start", "llm1"), edge("llm1", "end")],
            variables: vec![],
        };
        let executor = Arc::new(executor(config, ScriptedModel::new(vec!["hi"])));
        let (mut rx, handle) = executor.execute_stream(input("x"), CancelToken::new());

        let mut public = Vec::new();
        let mut internal = 0;
        while let Some(event) = rx.recv().await {
            if event.is_public() {
                public.push(event);
            } else {
                internal += 1;
            }
        }
        handle.await.unwrap().unwrap();

        // Public stream: start, messages, end - nothing node-level
        assert!(matches!(public.first(), Some(WorkflowEvent::Start { .. })));
        assert!(matches!(public.last(), Some(WorkflowEvent::End { .. })));
        assert!(internal > 0);
    }
}

//! Streaming Events & End-Node Segments
//!
//! The runtime communicates through one event stream. Public consumers see
//! `start`, `message`, `end`, `error`; internal consumers additionally see
//! `node_start`, `node_end`, `node_chunk`, `node_error`.
//!
//! End nodes declare their output as ordered *segments* — literal text or a
//! variable reference with an optional `depends_on` node. A segment is
//! emitted only once its dependency has completed (literals immediately);
//! the cursor makes emission order independent of event arrival order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mnemo_core::TokenUsage;

use crate::error::{Result, WorkflowError};
use crate::pool::{split_selector, VariablePool, NS_CONV, NS_SYS};
use crate::template::single_selector;

// ============================================================================
// EVENTS
// ============================================================================

/// One event on the execution stream
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Execution started
    Start {
        execution_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        timestamp: i64,
    },
    /// A chunk of the assembled End-node output
    Message { chunk: String },
    /// Node began executing (internal)
    NodeStart { node_id: String },
    /// Node finished (internal)
    NodeEnd {
        node_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        elapsed_time: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_usage: Option<TokenUsage>,
    },
    /// Raw chunk from a streaming node (internal)
    NodeChunk {
        node_id: String,
        chunk: String,
        done: bool,
    },
    /// Node failed (internal)
    NodeError {
        node_id: String,
        error: String,
        elapsed_time: f64,
    },
    /// Execution finished
    End {
        output: String,
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        elapsed_time: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        token_usage: Option<TokenUsage>,
    },
    /// Execution aborted
    Error { reason: String },
}

impl WorkflowEvent {
    /// Whether public consumers receive this event
    pub fn is_public(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::Start { .. }
                | WorkflowEvent::Message { .. }
                | WorkflowEvent::End { .. }
                | WorkflowEvent::Error { .. }
        )
    }
}

// ============================================================================
// SEGMENTS
// ============================================================================

/// One ordered piece of an End node's templated output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Segment {
    /// Fixed text, emittable immediately
    Literal { value: String },
    /// A variable reference; `depends_on` is the producing node, when the
    /// selector points at a node output
    Variable {
        selector: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        depends_on: Option<String>,
    },
}

impl Segment {
    /// Parse one segment from an End-node output declaration
    ///
    /// A string that is exactly one `{{selector}}` becomes a variable
    /// segment; anything else is literal text.
    pub fn parse(raw: &str) -> Self {
        match single_selector(raw) {
            Some(selector) => {
                let depends_on = split_selector(selector)
                    .ok()
                    .map(|(namespace, _)| namespace)
                    .filter(|ns| *ns != NS_SYS && *ns != NS_CONV)
                    .map(String::from);
                Segment::Variable {
                    selector: selector.to_string(),
                    depends_on,
                }
            }
            None => Segment::Literal {
                value: raw.to_string(),
            },
        }
    }

    /// Producing node, when the segment depends on one
    pub fn depends_on(&self) -> Option<&str> {
        match self {
            Segment::Variable { depends_on, .. } => depends_on.as_deref(),
            Segment::Literal { .. } => None,
        }
    }
}

// ============================================================================
// END-NODE STREAM STATE
// ============================================================================

/// Streaming cursor over one End node's segments
#[derive(Debug)]
pub struct EndStreamState {
    pub node_id: String,
    pub segments: Vec<Segment>,
    /// Next segment to emit
    pub cursor: usize,
    /// Whether this End node is known to be reached
    pub active: bool,
    /// Set while a streaming node is feeding the segment at the cursor
    pub streaming_from: Option<String>,
    /// Everything emitted so far, for the final output check
    pub emitted: String,
}

impl EndStreamState {
    pub fn new(node_id: impl Into<String>, segments: Vec<Segment>) -> Self {
        Self {
            node_id: node_id.into(),
            segments,
            cursor: 0,
            active: false,
            streaming_from: None,
            emitted: String::new(),
        }
    }

    pub fn finished(&self) -> bool {
        self.cursor >= self.segments.len()
    }

    /// Emit every segment whose dependency is satisfied, stopping at the
    /// first segment that must wait. With `force`, unresolvable variable
    /// segments render as empty rather than blocking.
    pub fn drain_ready(
        &mut self,
        pool: &VariablePool,
        completed: &dyn Fn(&str) -> bool,
        force: bool,
    ) -> Result<Vec<String>> {
        let mut chunks = Vec::new();
        while self.cursor < self.segments.len() {
            let segment = self.segments[self.cursor].clone();
            match segment {
                Segment::Literal { value } => {
                    if !value.is_empty() {
                        self.emitted.push_str(&value);
                        chunks.push(value);
                    }
                    self.cursor += 1;
                }
                Segment::Variable {
                    selector,
                    depends_on,
                } => {
                    let ready = depends_on
                        .as_deref()
                        .map(|node| completed(node))
                        .unwrap_or(true);
                    if !ready && !force {
                        break;
                    }
                    match pool.get_literal(&selector) {
                        Ok(text) => {
                            if !text.is_empty() {
                                self.emitted.push_str(&text);
                                chunks.push(text);
                            }
                        }
                        Err(WorkflowError::UnknownVariable(_)) if force => {
                            tracing::warn!(selector = %selector, "segment unresolved at flush");
                        }
                        Err(e) if force => return Err(e),
                        Err(_) => break,
                    }
                    self.cursor += 1;
                }
            }
        }
        Ok(chunks)
    }

    /// Record text streamed live into the segment at the cursor
    pub fn record_streamed(&mut self, text: &str) {
        self.emitted.push_str(text);
    }

    /// Advance past the segment at the cursor (its stream completed)
    pub fn advance(&mut self) {
        self.cursor += 1;
        self.streaming_from = None;
    }
}

// ============================================================================
// TESTS
// ============================================================================

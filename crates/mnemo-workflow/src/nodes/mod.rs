//! Workflow Nodes
//!
//! Node kinds are a tagged variant resolved at graph-build time: the raw
//! JSON config parses into a typed per-kind struct once, and execution
//! dispatches on the enum. Each run is wrapped into a standard outcome
//! `{status, input, output, elapsed_time, token_usage, error}` by the
//! executor.

mod assigner;
mod classifier;
mod code;
mod llm;

pub use assigner::{apply_assignment, AssignOp, Assignment, AssignerConfig};
pub use classifier::{ClassifierCategory, ClassifierConfig};
pub use code::CodeConfig;
pub use llm::{llm_input_value, run_llm_node, LlmConfig, LlmRunResult, ToolRegistry, WorkflowTool};
pub use classifier::{run_classifier_node, Classification};
pub use code::run_code_node;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mnemo_core::TokenUsage;

use crate::error::{Result, WorkflowError};
use crate::expression::Case;
use crate::stream::Segment;
use crate::variable::VariableType;

// ============================================================================
// WIRE CONFIGURATION
// ============================================================================

/// Raw workflow definition as supplied by callers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    /// Conversation-variable declarations (`conv.*`)
    #[serde(default)]
    pub variables: Vec<ConvVarSpec>,
}

/// Raw node entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Value,
}

/// Raw edge entry; `type: "error"` marks an error edge, `branch` routes a
/// branch node's `CASEi` output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
    #[serde(default, rename = "type")]
    pub edge_type: String,
    #[serde(default)]
    pub branch: Option<String>,
}

impl EdgeSpec {
    pub fn is_error(&self) -> bool {
        self.edge_type == "error"
    }
}

/// Conversation-variable declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvVarSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: String,
    #[serde(default)]
    pub default: Option<Value>,
}

// ============================================================================
// TYPED NODES
// ============================================================================

/// If-else node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfElseConfig {
    pub cases: Vec<Case>,
}

/// Jinja-render node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JinjaConfig {
    pub template: String,
    #[serde(default)]
    pub mapping: Vec<JinjaMapping>,
    /// Strict mode errors on missing variables; non-strict substitutes empty
    #[serde(default)]
    pub strict: bool,
}

/// One template variable binding: template name -> pool selector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JinjaMapping {
    pub name: String,
    pub value: String,
}

/// Loop / iteration node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Collection selector; absent means condition/count-driven looping
    #[serde(default)]
    pub collection: Option<String>,
    /// Upper bound on iterations
    #[serde(default = "default_max_loops")]
    pub max_loops: usize,
    /// Exit condition checked after each iteration
    #[serde(default)]
    pub exit_condition: Option<Case>,
    /// Body subgraph; back-edges are confined to this scope
    pub body: WorkflowConfig,
}

fn default_max_loops() -> usize {
    10
}

/// End node configuration: ordered output declarations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndConfig {
    /// Each entry is literal text or exactly one `{{selector}}`
    pub outputs: Vec<String>,
}

impl EndConfig {
    /// Pre-parse the declarations into stream segments
    pub fn segments(&self) -> Vec<Segment> {
        self.outputs.iter().map(|raw| Segment::parse(raw)).collect()
    }
}

/// Node kind with its parsed configuration
#[derive(Debug, Clone)]
pub enum NodeKind {
    Start,
    Llm(LlmConfig),
    IfElse(IfElseConfig),
    Assigner(AssignerConfig),
    JinjaRender(JinjaConfig),
    QuestionClassifier(ClassifierConfig),
    Loop(LoopConfig),
    Iteration(LoopConfig),
    Code(CodeConfig),
    End(EndConfig),
}

impl NodeKind {
    /// Wire name of the kind
    pub fn type_name(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::Llm(_) => "llm",
            NodeKind::IfElse(_) => "if-else",
            NodeKind::Assigner(_) => "assigner",
            NodeKind::JinjaRender(_) => "jinja-render",
            NodeKind::QuestionClassifier(_) => "question-classifier",
            NodeKind::Loop(_) => "loop",
            NodeKind::Iteration(_) => "iteration",
            NodeKind::Code(_) => "code",
            NodeKind::End(_) => "end",
        }
    }

    /// Branch nodes activate exactly one successor based on their output
    pub fn is_branch(&self) -> bool {
        matches!(self, NodeKind::IfElse(_) | NodeKind::QuestionClassifier(_))
    }

    /// Declared outputs of the node, resolved at build time
    pub fn output_types(&self) -> Vec<(&'static str, VariableType)> {
        match self {
            NodeKind::Start => vec![],
            NodeKind::Llm(_) => vec![("output", VariableType::String)],
            NodeKind::IfElse(_) => vec![("output", VariableType::String)],
            NodeKind::Assigner(_) => vec![],
            NodeKind::JinjaRender(_) => vec![("output", VariableType::String)],
            NodeKind::QuestionClassifier(_) => vec![
                ("class_name", VariableType::String),
                ("output", VariableType::String),
            ],
            NodeKind::Loop(_) | NodeKind::Iteration(_) => {
                vec![("output", VariableType::ArrayObject)]
            }
            NodeKind::Code(config) => vec![("output", config.output_type())],
            NodeKind::End(_) => vec![("output", VariableType::String)],
        }
    }
}

/// A build-time resolved node
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
}

impl Node {
    /// Parse one raw node spec into its typed form
    pub fn parse(spec: &NodeSpec) -> Result<Self> {
        let invalid = |reason: String| WorkflowError::InvalidNode {
            node_id: spec.id.clone(),
            reason,
        };

        let kind = match spec.node_type.as_str() {
            "start" => NodeKind::Start,
            "llm" => NodeKind::Llm(
                serde_json::from_value(spec.config.clone())
                    .map_err(|e| invalid(e.to_string()))?,
            ),
            "if-else" => NodeKind::IfElse(
                serde_json::from_value(spec.config.clone())
                    .map_err(|e| invalid(e.to_string()))?,
            ),
            "assigner" => NodeKind::Assigner(
                serde_json::from_value(spec.config.clone())
                    .map_err(|e| invalid(e.to_string()))?,
            ),
            "jinja-render" => NodeKind::JinjaRender(
                serde_json::from_value(spec.config.clone())
                    .map_err(|e| invalid(e.to_string()))?,
            ),
            "question-classifier" => NodeKind::QuestionClassifier(
                serde_json::from_value(spec.config.clone())
                    .map_err(|e| invalid(e.to_string()))?,
            ),
            "loop" => NodeKind::Loop(
                serde_json::from_value(spec.config.clone())
                    .map_err(|e| invalid(e.to_string()))?,
            ),
            "iteration" => NodeKind::Iteration(
                serde_json::from_value(spec.config.clone())
                    .map_err(|e| invalid(e.to_string()))?,
            ),
            "code" => NodeKind::Code(
                serde_json::from_value(spec.config.clone())
                    .map_err(|e| invalid(e.to_string()))?,
            ),
            "end" => NodeKind::End(
                serde_json::from_value(spec.config.clone())
                    .map_err(|e| invalid(e.to_string()))?,
            ),
            other => {
                return Err(invalid(format!("unknown node type '{other}'")));
            }
        };

        Ok(Node {
            id: spec.id.clone(),
            name: spec.name.clone().unwrap_or_else(|| spec.id.clone()),
            kind,
        })
    }
}

// ============================================================================
// OUTCOME
// ============================================================================

/// Standardized result of one node run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeOutcome {
    pub node_id: String,
    pub node_type: String,
    pub node_name: String,
    pub status: String,
    pub input: Value,
    pub output: Option<Value>,
    pub elapsed_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Chosen branch handle for branch nodes (`CASEi`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl NodeOutcome {
    pub fn completed(node: &Node, input: Value, output: Option<Value>, elapsed_time: f64) -> Self {
        Self {
            node_id: node.id.clone(),
            node_type: node.kind.type_name().to_string(),
            node_name: node.name.clone(),
            status: "completed".to_string(),
            input,
            output,
            elapsed_time,
            token_usage: None,
            error: None,
            branch: None,
        }
    }

    pub fn failed(node: &Node, input: Value, error: String, elapsed_time: f64) -> Self {
        Self {
            node_id: node.id.clone(),
            node_type: node.kind.type_name().to_string(),
            node_name: node.name.clone(),
            status: "failed".to_string(),
            input,
            output: None,
            elapsed_time,
            token_usage: None,
            error: Some(error),
            branch: None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

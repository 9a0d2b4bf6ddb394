//! # Mnemo Workflow
//!
//! Typed DAG workflow runtime driving the memory engine's read and write
//! paths, and arbitrary user-defined graphs. Nodes are a tagged variant
//! resolved at build time (start, llm, if-else, assigner, jinja-render,
//! question-classifier, loop/iteration, code, end); execution runs over a
//! variable pool with `sys` / `conv` / per-node namespaces, streams End-node
//! output segment by segment, and checkpoints state per execution for
//! conversation continuity.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mnemo_workflow::{WorkflowConfig, WorkflowExecutor, WorkflowRunInput};
//!
//! let config: WorkflowConfig = serde_json::from_str(definition)?;
//! let executor = WorkflowExecutor::new(config, model, memory_config)?;
//! let output = executor.execute(WorkflowRunInput {
//!     message: "hello".into(),
//!     user_id: "u1".into(),
//!     workspace_id: "w1".into(),
//!     ..Default::default()
//! }).await?;
//! ```

pub mod error;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod nodes;
pub mod pool;
pub mod stream;
pub mod template;
pub mod variable;

pub use error::{Result, WorkflowError};
pub use executor::{CancelToken, WorkflowExecutor, WorkflowRunInput, WorkflowRunOutput};
pub use expression::{Case, CompareOp, Expression, LogicalOperator, OperandKind};
pub use graph::WorkflowGraph;
pub use nodes::{
    AssignOp, Assignment, AssignerConfig, ClassifierCategory, ClassifierConfig, CodeConfig,
    ConvVarSpec, EdgeSpec, EndConfig, IfElseConfig, JinjaConfig, JinjaMapping, LlmConfig,
    LoopConfig, Node, NodeKind, NodeOutcome, NodeSpec, ToolRegistry, WorkflowConfig, WorkflowTool,
};
pub use pool::{VariablePool, NS_CONV, NS_SYS};
pub use stream::{EndStreamState, Segment, WorkflowEvent};
pub use template::render_template;
pub use variable::{value_to_text, VariableType};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

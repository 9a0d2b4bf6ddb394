//! Assigner Node
//!
//! Mutates `conv.*` variables through a fixed operation set. Writes into
//! immutable namespaces fail, type mismatches fail, and `clear` resets a
//! variable to its type's zero value.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, WorkflowError};
use crate::pool::VariablePool;
use crate::variable::VariableType;

/// Assignment operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignOp {
    #[serde(alias = "sub")]
    Subtract,
    #[serde(alias = "mul")]
    Multiply,
    #[serde(alias = "div")]
    Divide,
    Add,
    Assign,
    Cover,
    Clear,
    Append,
    RemoveFirst,
    RemoveLast,
}

/// One assignment instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub variable_selector: String,
    pub operation: AssignOp,
    #[serde(default)]
    pub value: Value,
}

/// Assigner node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignerConfig {
    pub assignments: Vec<Assignment>,
}

/// Apply one assignment to the pool
pub fn apply_assignment(assignment: &Assignment, pool: &mut VariablePool) -> Result<()> {
    let selector = assignment.variable_selector.clone();
    let ty = pool
        .type_of(&selector)
        .ok_or_else(|| WorkflowError::UnknownVariable(selector.clone()))?;
    let current = pool
        .get(&selector)
        .cloned()
        .ok_or_else(|| WorkflowError::UnknownVariable(selector.clone()))?;

    let unsupported = || WorkflowError::InvalidNode {
        node_id: selector.clone(),
        reason: format!("operation {:?} is not valid for {:?}", assignment.operation, ty),
    };

    let new_value = match assignment.operation {
        AssignOp::Assign | AssignOp::Cover => assignment.value.clone(),
        AssignOp::Clear => ty.default_value(),
        AssignOp::Add | AssignOp::Subtract | AssignOp::Multiply | AssignOp::Divide => {
            if ty != VariableType::Number {
                return Err(unsupported());
            }
            let left = current.as_f64().ok_or_else(unsupported)?;
            let right = assignment.value.as_f64().ok_or_else(|| WorkflowError::TypeMismatch {
                selector: selector.clone(),
                expected: VariableType::Number,
                got: assignment.value.clone(),
            })?;
            let result = match assignment.operation {
                AssignOp::Add => left + right,
                AssignOp::Subtract => left - right,
                AssignOp::Multiply => left * right,
                AssignOp::Divide => {
                    if right == 0.0 {
                        return Err(WorkflowError::InvalidNode {
                            node_id: selector.clone(),
                            reason: "division by zero".to_string(),
                        });
                    }
                    left / right
                }
                _ => unreachable!(),
            };
            number_value(result)
        }
        AssignOp::Append => {
            if !ty.is_array() {
                return Err(unsupported());
            }
            let mut items = current.as_array().cloned().unwrap_or_default();
            items.push(assignment.value.clone());
            Value::Array(items)
        }
        AssignOp::RemoveFirst => {
            if !ty.is_array() {
                return Err(unsupported());
            }
            let mut items = current.as_array().cloned().unwrap_or_default();
            if !items.is_empty() {
                items.remove(0);
            }
            Value::Array(items)
        }
        AssignOp::RemoveLast => {
            if !ty.is_array() {
                return Err(unsupported());
            }
            let mut items = current.as_array().cloned().unwrap_or_default();
            items.pop();
            Value::Array(items)
        }
    };

    pool.assign(&selector, new_value)
}

/// Keep whole results integral so `1 + 3` reads back as `4`, not `4.0`
fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

// ============================================================================
// TESTS
// ============================================================================

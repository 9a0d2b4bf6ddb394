//! Condition Evaluation
//!
//! If-else cases are lists of expressions joined by a logical operator.
//! Operands resolve against the variable pool: a bare `{{selector}}` keeps
//! its typed value, anything else renders to a string.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WorkflowError};
use crate::pool::VariablePool;
use crate::template::{render_template, single_selector};

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    #[serde(rename = "startwith")]
    StartsWith,
    #[serde(rename = "endwith")]
    EndsWith,
    Empty,
    NotEmpty,
}

/// How the right operand is supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperandKind {
    #[default]
    Constant,
    Variable,
}

/// One comparison
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expression {
    pub left: String,
    pub operator: CompareOp,
    #[serde(default)]
    pub right: Value,
    #[serde(default)]
    pub input_type: OperandKind,
}

/// Case combinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// One if-else case: expressions joined by the logical operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    pub expressions: Vec<Expression>,
}

impl Case {
    /// Evaluate the whole case against the pool
    pub fn evaluate(&self, pool: &VariablePool) -> Result<bool> {
        match self.logical_operator {
            LogicalOperator::And => {
                for expression in &self.expressions {
                    if !evaluate_expression(expression, pool)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            LogicalOperator::Or => {
                for expression in &self.expressions {
                    if evaluate_expression(expression, pool)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

/// Resolve an operand to its typed value
fn resolve_operand(raw: &str, pool: &VariablePool) -> Result<Value> {
    if let Some(selector) = single_selector(raw) {
        return pool
            .get(selector)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownVariable(selector.to_string()));
    }
    Ok(Value::String(render_template(raw, pool, false)?))
}

fn resolve_right(expression: &Expression, pool: &VariablePool) -> Result<Value> {
    match expression.input_type {
        OperandKind::Constant => Ok(expression.right.clone()),
        OperandKind::Variable => {
            let selector = expression
                .right
                .as_str()
                .ok_or_else(|| WorkflowError::InvalidSelector(expression.right.to_string()))?;
            resolve_operand(selector, pool)
        }
    }
}

/// Evaluate one comparison
pub fn evaluate_expression(expression: &Expression, pool: &VariablePool) -> Result<bool> {
    let left = resolve_operand(&expression.left, pool)?;

    // Emptiness tests need no right operand
    match expression.operator {
        CompareOp::Empty => return Ok(is_empty(&left)),
        CompareOp::NotEmpty => return Ok(!is_empty(&left)),
        _ => {}
    }

    let right = resolve_right(expression, pool)?;

    // Numeric comparison when both sides are numbers (or parse as numbers)
    if let (Some(l), Some(r)) = (as_number(&left), as_number(&right)) {
        return Ok(match expression.operator {
            CompareOp::Eq => (l - r).abs() < f64::EPSILON,
            CompareOp::Ne => (l - r).abs() >= f64::EPSILON,
            CompareOp::Gt => l > r,
            CompareOp::Ge => l >= r,
            CompareOp::Lt => l < r,
            CompareOp::Le => l <= r,
            CompareOp::Contains
            | CompareOp::StartsWith
            | CompareOp::EndsWith => string_compare(&left, &right, expression.operator),
            CompareOp::Empty | CompareOp::NotEmpty => unreachable!(),
        });
    }

    // Boolean equality
    if let (Some(l), Some(r)) = (left.as_bool(), right.as_bool()) {
        return Ok(match expression.operator {
            CompareOp::Eq => l == r,
            CompareOp::Ne => l != r,
            _ => false,
        });
    }

    // Array membership for contains
    if expression.operator == CompareOp::Contains {
        if let Some(items) = left.as_array() {
            return Ok(items.iter().any(|item| item == &right));
        }
    }

    Ok(string_compare(&left, &right, expression.operator))
}

fn string_compare(left: &Value, right: &Value, op: CompareOp) -> bool {
    let l = text_of(left);
    let r = text_of(right);
    match op {
        CompareOp::Eq => l == r,
        CompareOp::Ne => l != r,
        CompareOp::Contains => l.contains(&r),
        CompareOp::StartsWith => l.starts_with(&r),
        CompareOp::EndsWith => l.ends_with(&r),
        CompareOp::Gt => l > r,
        CompareOp::Ge => l >= r,
        CompareOp::Lt => l < r,
        CompareOp::Le => l <= r,
        CompareOp::Empty | CompareOp::NotEmpty => false,
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

// ============================================================================
// TESTS
// ============================================================================

//! Code Node
//!
//! User logic over the variable pool, expressed as a sandboxed minijinja
//! expression. The expression sees `sys`, `conv`, and every node-output
//! namespace as nested objects; it cannot reach the filesystem, network, or
//! clock.

use minijinja::Environment;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WorkflowError};
use crate::pool::{VariablePool, NS_CONV, NS_SYS};
use crate::variable::{value_to_text, VariableType};

/// Code node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeConfig {
    /// Minijinja expression, e.g. `conv.items | length` or
    /// `sys.message ~ \" (\" ~ conv.count ~ \")\"`
    pub expression: String,
    /// Declared output type; defaults to string
    #[serde(default)]
    pub output_type: Option<String>,
}

impl CodeConfig {
    pub fn output_type(&self) -> VariableType {
        self.output_type
            .as_deref()
            .and_then(VariableType::parse_name)
            .unwrap_or(VariableType::String)
    }
}

/// Evaluate the expression against the pool
pub fn run_code_node(node_id: &str, config: &CodeConfig, pool: &VariablePool) -> Result<Value> {
    let env = Environment::new();
    let expr = env
        .compile_expression(&config.expression)
        .map_err(|e| WorkflowError::InvalidNode {
            node_id: node_id.to_string(),
            reason: format!("expression does not compile: {e}"),
        })?;

    let mut context = serde_json::Map::new();
    context.insert(
        NS_SYS.to_string(),
        Value::Object(pool.namespace_values(NS_SYS).into_iter().collect()),
    );
    context.insert(
        NS_CONV.to_string(),
        Value::Object(pool.namespace_values(NS_CONV).into_iter().collect()),
    );
    for (node, outputs) in pool.node_output_values() {
        context.insert(node, Value::Object(outputs.into_iter().collect()));
    }

    let result = expr
        .eval(minijinja::Value::from_serialize(&Value::Object(context)))
        .map_err(|e| WorkflowError::Template(e.to_string()))?;

    let value: Value = serde_json::to_value(&result)?;

    // Coerce onto the declared output type where the shapes disagree
    let declared = config.output_type();
    if declared.accepts(&value) {
        Ok(value)
    } else if declared == VariableType::String {
        Ok(Value::String(value_to_text(&value)))
    } else {
        Err(WorkflowError::TypeMismatch {
            selector: format!("{node_id}.output"),
            expected: declared,
            got: value,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pool() -> VariablePool {
        let mut pool = VariablePool::new();
        pool.declare(NS_SYS, "message", json!("hello"), VariableType::String, false)
            .unwrap();
        pool.declare(NS_CONV, "items", json!(["a", "b", "c"]), VariableType::ArrayString, true)
            .unwrap();
        pool.declare(NS_CONV, "count", json!(2), VariableType::Number, true)
            .unwrap();
        pool
    }

    fn config(expression: &str, output_type: Option<&str>) -> CodeConfig {
        CodeConfig {
            expression: expression.to_string(),
            output_type: output_type.map(String::from),
        }
    }

    #[test]
    fn test_expression_over_pool() {
        let value = run_code_node("code1", &config("conv.items | length", Some("number")), &pool())
            .unwrap();
        assert_eq!(value, json!(3));
    }

    #[test]
    fn test_string_concatenation() {
        let value = run_code_node(
            "code1",
            &config("sys.message ~ \"!\"", None),
            &pool(),
        )
        .unwrap();
        assert_eq!(value, json!("hello!"));
    }

    #[test]
    fn test_arithmetic_coerced_to_declared_string() {
        let value = run_code_node("code1", &config("conv.count + 1", None), &pool()).unwrap();
        assert_eq!(value, json!("3"));
    }

    #[test]
    fn test_type_mismatch_fails() {
        let result = run_code_node("code1", &config("sys.message", Some("number")), &pool());
        assert!(matches!(result, Err(WorkflowError::TypeMismatch { .. })));
    }

    #[test]
    fn test_bad_expression_fails_at_build() {
        let result = run_code_node("code1", &config("conv.items |", None), &pool());
        assert!(matches!(result, Err(WorkflowError::InvalidNode { .. })));
    }
}

//! Typed Variables
//!
//! Every variable in the pool carries a `VariableType`; writes that do not
//! match the declared type fail the writing node. `clear` resets a variable
//! to its type's zero value.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Variable types supported by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Object,
    ArrayString,
    ArrayNumber,
    ArrayObject,
    ArrayFile,
}

impl VariableType {
    /// Parse a config-level type name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "string" => Some(VariableType::String),
            "number" => Some(VariableType::Number),
            "boolean" | "bool" => Some(VariableType::Boolean),
            "object" => Some(VariableType::Object),
            "array_string" | "array[string]" => Some(VariableType::ArrayString),
            "array_number" | "array[number]" => Some(VariableType::ArrayNumber),
            "array_object" | "array[object]" => Some(VariableType::ArrayObject),
            "array_file" | "array[file]" => Some(VariableType::ArrayFile),
            _ => None,
        }
    }

    /// The zero value produced by `clear`
    pub fn default_value(&self) -> Value {
        match self {
            VariableType::String => json!(""),
            VariableType::Number => json!(0),
            VariableType::Boolean => json!(false),
            VariableType::Object => json!({}),
            VariableType::ArrayString
            | VariableType::ArrayNumber
            | VariableType::ArrayObject
            | VariableType::ArrayFile => json!([]),
        }
    }

    /// Whether a JSON value inhabits this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            VariableType::String => value.is_string(),
            VariableType::Number => value.is_number(),
            VariableType::Boolean => value.is_boolean(),
            VariableType::Object => value.is_object(),
            VariableType::ArrayString => value
                .as_array()
                .map(|a| a.iter().all(Value::is_string))
                .unwrap_or(false),
            VariableType::ArrayNumber => value
                .as_array()
                .map(|a| a.iter().all(Value::is_number))
                .unwrap_or(false),
            VariableType::ArrayObject => value
                .as_array()
                .map(|a| a.iter().all(Value::is_object))
                .unwrap_or(false),
            VariableType::ArrayFile => value.is_array(),
        }
    }

    /// Whether this is one of the array types
    pub fn is_array(&self) -> bool {
        matches!(
            self,
            VariableType::ArrayString
                | VariableType::ArrayNumber
                | VariableType::ArrayObject
                | VariableType::ArrayFile
        )
    }
}

/// Render a variable value as flowing text (End segments, templates)
///
/// Strings render bare; everything else renders as compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

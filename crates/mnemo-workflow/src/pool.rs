//! Variable Pool
//!
//! Three namespaces: `sys.*` is written once at start and immutable from
//! then on, `conv.*` is mutable and persists across executions of one
//! conversation, and `<node_id>.*` holds per-node outputs. Writes are
//! type-checked against the variable's declared `VariableType`.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::{Result, WorkflowError};
use crate::variable::{value_to_text, VariableType};

/// System namespace name
pub const NS_SYS: &str = "sys";
/// Conversation namespace name
pub const NS_CONV: &str = "conv";

#[derive(Debug, Clone)]
struct Variable {
    value: Value,
    ty: VariableType,
    mutable: bool,
}

/// Namespaced, typed variable storage
#[derive(Debug, Default)]
pub struct VariablePool {
    namespaces: HashMap<String, HashMap<String, Variable>>,
}

impl VariablePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a variable
    ///
    /// `sys.*` variables are always immutable regardless of `mutable`.
    pub fn declare(
        &mut self,
        namespace: &str,
        key: &str,
        value: Value,
        ty: VariableType,
        mutable: bool,
    ) -> Result<()> {
        if !ty.accepts(&value) && !value.is_null() {
            return Err(WorkflowError::TypeMismatch {
                selector: format!("{namespace}.{key}"),
                expected: ty,
                got: value,
            });
        }
        let value = if value.is_null() { ty.default_value() } else { value };
        let mutable = mutable && namespace != NS_SYS;
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), Variable { value, ty, mutable });
        Ok(())
    }

    /// Overwrite a mutable variable, keeping its declared type
    pub fn assign(&mut self, selector: &str, value: Value) -> Result<()> {
        let (namespace, key) = split_selector(selector)?;
        if namespace == NS_SYS {
            return Err(WorkflowError::ImmutableNamespace(selector.to_string()));
        }
        let variable = self
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.get_mut(key))
            .ok_or_else(|| WorkflowError::UnknownVariable(selector.to_string()))?;
        if !variable.mutable {
            return Err(WorkflowError::ImmutableNamespace(selector.to_string()));
        }
        if !variable.ty.accepts(&value) {
            return Err(WorkflowError::TypeMismatch {
                selector: selector.to_string(),
                expected: variable.ty,
                got: value,
            });
        }
        variable.value = value;
        Ok(())
    }

    /// Fetch a value by selector
    pub fn get(&self, selector: &str) -> Option<&Value> {
        let (namespace, key) = split_selector(selector).ok()?;
        self.namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .map(|v| &v.value)
    }

    /// Fetch a value, with a default and strictness control
    pub fn get_value(&self, selector: &str, default: Option<Value>, strict: bool) -> Result<Value> {
        match self.get(selector) {
            Some(value) => Ok(value.clone()),
            None if strict => Err(WorkflowError::UnknownVariable(selector.to_string())),
            None => Ok(default.unwrap_or(Value::Null)),
        }
    }

    /// Declared type of a variable
    pub fn type_of(&self, selector: &str) -> Option<VariableType> {
        let (namespace, key) = split_selector(selector).ok()?;
        self.namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .map(|v| v.ty)
    }

    pub fn has(&self, selector: &str) -> bool {
        self.get(selector).is_some()
    }

    /// Textual rendering of a variable (End segments)
    pub fn get_literal(&self, selector: &str) -> Result<String> {
        self.get(selector)
            .map(value_to_text)
            .ok_or_else(|| WorkflowError::UnknownVariable(selector.to_string()))
    }

    /// All variables of one namespace as plain values
    pub fn namespace_values(&self, namespace: &str) -> HashMap<String, Value> {
        self.namespaces
            .get(namespace)
            .map(|ns| {
                ns.iter()
                    .map(|(k, v)| (k.clone(), v.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All node-output namespaces (everything except sys/conv)
    pub fn node_output_values(&self) -> HashMap<String, HashMap<String, Value>> {
        self.namespaces
            .iter()
            .filter(|(name, _)| name.as_str() != NS_SYS && name.as_str() != NS_CONV)
            .map(|(name, ns)| {
                (
                    name.clone(),
                    ns.iter()
                        .map(|(k, v)| (k.clone(), v.value.clone()))
                        .collect(),
                )
            })
            .collect()
    }

    /// Seed `conv.*` from a persisted checkpoint
    pub fn restore_conversation(&mut self, values: &Value) {
        let Some(map) = values.as_object() else {
            return;
        };
        for (key, value) in map {
            if let Some(existing) = self
                .namespaces
                .get_mut(NS_CONV)
                .and_then(|ns| ns.get_mut(key))
            {
                if existing.ty.accepts(value) {
                    existing.value = value.clone();
                }
            }
        }
    }
}

/// Split `namespace.key` selectors; `{{ }}` wrapping is tolerated
pub fn split_selector(selector: &str) -> Result<(&str, &str)> {
    let inner = strip_braces(selector);
    inner
        .split_once('.')
        .filter(|(ns, key)| !ns.is_empty() && !key.is_empty())
        .ok_or_else(|| WorkflowError::InvalidSelector(selector.to_string()))
}

/// Strip one layer of `{{ ... }}` around a selector
pub fn strip_braces(selector: &str) -> &str {
    let trimmed = selector.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

// ============================================================================
// TESTS
// ============================================================================

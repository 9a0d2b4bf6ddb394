//! Selector Templates
//!
//! Lightweight `{{namespace.key}}` substitution used in prompts, condition
//! operands, and End-node output declarations. Strict mode errors on an
//! unknown variable; non-strict mode substitutes the empty string.

use crate::error::{Result, WorkflowError};
use crate::pool::VariablePool;
use crate::variable::value_to_text;

/// Render a template against the pool
pub fn render_template(template: &str, pool: &VariablePool, strict: bool) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            // Unterminated braces are literal text
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let selector = after_open[..close].trim();
        match pool.get(selector) {
            Some(value) => out.push_str(&value_to_text(value)),
            None if strict => {
                return Err(WorkflowError::UnknownVariable(selector.to_string()));
            }
            None => {}
        }
        rest = &after_open[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Whether the string is exactly one `{{selector}}` reference
pub fn single_selector(template: &str) -> Option<&str> {
    let trimmed = template.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?.trim();
    if inner.contains("{{") || inner.is_empty() {
        return None;
    }
    Some(inner)
}

// ============================================================================
// TESTS
// ============================================================================

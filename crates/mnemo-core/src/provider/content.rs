//! Content-Part Shaping
//!
//! The only provider-aware branch in the core. Text-only messages travel as
//! plain strings. Multimodal messages travel as an ordered list of parts:
//! OpenAI-style providers expect `{"type": "text", "text": ...}`, DashScope
//! expects `{"text": ...}`; provider-shaped media parts supplied by the
//! caller are appended after the text part unchanged.

use serde_json::{json, Value};

use crate::provider::{ChatMessage, ChatRole, ProviderKind};

/// Build the wire-shape text part for a provider family
pub fn text_part(kind: ProviderKind, text: &str) -> Value {
    match kind {
        ProviderKind::DashScope => json!({ "text": text }),
        _ => json!({ "type": "text", "text": text }),
    }
}

/// Serialize one chat message into the provider's wire shape
pub fn message_to_wire(kind: ProviderKind, message: &ChatMessage) -> Value {
    let role = match message.role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    };

    let content: Value = if message.media_parts.is_empty() {
        // Text-only: plain string on the wire
        Value::String(message.content.clone().unwrap_or_default())
    } else {
        let mut parts = Vec::with_capacity(message.media_parts.len() + 1);
        if let Some(text) = &message.content {
            if !text.is_empty() {
                parts.push(text_part(kind, text));
            }
        }
        parts.extend(message.media_parts.iter().cloned());
        Value::Array(parts)
    };

    let mut wire = json!({ "role": role, "content": content });
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = json!(message
            .tool_calls
            .iter()
            .map(|call| json!({
                "id": call.id,
                "type": call.r#type,
                "function": {
                    "name": call.function.name,
                    "arguments": call.function.arguments.to_string(),
                }
            }))
            .collect::<Vec<_>>());
        if message.content.is_none() {
            wire["content"] = Value::Null;
        }
    }
    if let Some(tool_call_id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(tool_call_id);
    }
    wire
}

/// Normalize model output that may arrive as `{"text": ...}` parts
pub fn output_to_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        Value::Array(parts) => parts.iter().map(output_to_text).collect::<Vec<_>>().join(""),
        _ => String::new(),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_only_message_is_plain_string() {
        let wire = message_to_wire(ProviderKind::OpenAi, &ChatMessage::user("hello"));
        assert_eq!(wire["content"], "hello");
        assert_eq!(wire["role"], "user");
    }

    #[test]
    fn test_multimodal_openai_shape() {
        let mut message = ChatMessage::user("describe this");
        message.media_parts = vec![json!({"type": "image_url", "image_url": {"url": "u"}})];
        let wire = message_to_wire(ProviderKind::OpenAi, &message);
        let parts = wire["content"].as_array().unwrap();
        assert_eq!(parts[0], json!({"type": "text", "text": "describe this"}));
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn test_multimodal_dashscope_shape() {
        let mut message = ChatMessage::user("describe this");
        message.media_parts = vec![json!({"image": "u"})];
        let wire = message_to_wire(ProviderKind::DashScope, &message);
        let parts = wire["content"].as_array().unwrap();
        assert_eq!(parts[0], json!({"text": "describe this"}));
    }

    #[test]
    fn test_output_to_text_handles_part_lists() {
        assert_eq!(output_to_text(&json!("plain")), "plain");
        assert_eq!(output_to_text(&json!({"text": "boxed"})), "boxed");
        assert_eq!(
            output_to_text(&json!([{"text": "a"}, {"text": "b"}])),
            "ab"
        );
    }
}

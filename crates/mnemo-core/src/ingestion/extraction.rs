//! Turn Extraction
//!
//! One structured LLM call per chunk turning raw dialogue text into
//! statements, entities, and a summary. A schema mismatch gets one stricter
//! retry (inside `chat_structured`); a second failure fails the turn.

use serde::{Deserialize, Serialize};

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::graph::{StmtType, TemporalInfo};
use crate::provider::{chat_structured, ChatMessage, ChatOptions, LanguageModel};

/// Statement draft as returned by the extraction call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementDraft {
    pub statement: String,
    #[serde(default)]
    pub stmt_type: String,
    #[serde(default)]
    pub temporal_info: String,
    #[serde(default)]
    pub valid_at: Option<String>,
    #[serde(default)]
    pub invalid_at: Option<String>,
    #[serde(default)]
    pub emotion_type: Option<String>,
    #[serde(default)]
    pub emotion_intensity: Option<f64>,
    #[serde(default)]
    pub emotion_subject: Option<String>,
    #[serde(default)]
    pub emotion_keywords: Vec<String>,
    #[serde(default = "default_importance")]
    pub importance_score: f64,
}

fn default_importance() -> f64 {
    0.5
}

impl StatementDraft {
    pub fn stmt_type(&self) -> StmtType {
        StmtType::parse_name(&self.stmt_type)
    }

    pub fn temporal_info(&self) -> TemporalInfo {
        TemporalInfo::parse_name(&self.temporal_info)
    }
}

/// Entity draft as returned by the extraction call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDraft {
    pub name: String,
    #[serde(default)]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_connect_strength")]
    pub connect_strength: f64,
    #[serde(default)]
    pub is_explicit_memory: bool,
    /// Indices into the chunk's statements that mention this entity
    #[serde(default)]
    pub statement_indices: Vec<usize>,
}

fn default_connect_strength() -> f64 {
    1.0
}

/// Result of extracting one chunk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(default)]
    pub statements: Vec<StatementDraft>,
    #[serde(default)]
    pub entities: Vec<EntityDraft>,
    #[serde(default)]
    pub summary: String,
}

const EXTRACTION_SYSTEM_PROMPT: &str = "You distill conversational turns into structured memory. \
Given a dialogue chunk, extract:\n\
- statements: atomic clauses, each with stmt_type (FACT|OPINION|PREDICTION), temporal_info \
(STATIC|DYNAMIC|ATEMPORAL), optional valid_at/invalid_at RFC3339 timestamps, optional \
emotion_type/emotion_intensity (0-1)/emotion_subject/emotion_keywords, and an importance_score \
in [0, 1].\n\
- entities: named entities with name, entity_type, description, aliases, connect_strength \
(0-1), is_explicit_memory, and statement_indices referencing the statements that mention them.\n\
- summary: one short paragraph summarizing the chunk.\n\
Respond with a single JSON object {\"statements\": [...], \"entities\": [...], \"summary\": \"...\"}.";

/// Extract structured memory from one chunk of dialogue
pub async fn extract_chunk(
    model: &dyn LanguageModel,
    config: &MemoryConfig,
    chunk_text: &str,
    language: Option<&str>,
) -> Result<ExtractionResult> {
    let mut user_prompt = String::new();
    if let Some(language) = language {
        user_prompt.push_str(&format!("Write statements and the summary in {language}.\n"));
    }
    user_prompt.push_str("Dialogue chunk:\n");
    user_prompt.push_str(chunk_text);

    let messages = vec![
        ChatMessage::system(EXTRACTION_SYSTEM_PROMPT),
        ChatMessage::user(user_prompt),
    ];

    chat_structured::<ExtractionResult>(
        model,
        &config.llm_model_id,
        &messages,
        &ChatOptions {
            temperature: Some(0.1),
            ..Default::default()
        },
    )
    .await
    .map_err(|e| match e {
        MemoryError::LlmParseError(msg) => MemoryError::ExtractionFailed(msg),
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_result_tolerates_missing_fields() {
        let parsed: ExtractionResult = serde_json::from_str(
            r#"{"statements": [{"statement": "likes tea"}], "summary": "tea"}"#,
        )
        .unwrap();
        assert_eq!(parsed.statements.len(), 1);
        assert_eq!(parsed.statements[0].stmt_type(), StmtType::Fact);
        assert_eq!(parsed.statements[0].temporal_info(), TemporalInfo::Atemporal);
        assert!((parsed.statements[0].importance_score - 0.5).abs() < f64::EPSILON);
        assert!(parsed.entities.is_empty());
    }

    #[test]
    fn test_draft_type_parsing() {
        let draft = StatementDraft {
            statement: "will visit Tokyo".to_string(),
            stmt_type: "prediction".to_string(),
            temporal_info: "dynamic".to_string(),
            valid_at: None,
            invalid_at: None,
            emotion_type: None,
            emotion_intensity: None,
            emotion_subject: None,
            emotion_keywords: vec![],
            importance_score: 0.5,
        };
        assert_eq!(draft.stmt_type(), StmtType::Prediction);
        assert_eq!(draft.temporal_info(), TemporalInfo::Dynamic);
    }
}

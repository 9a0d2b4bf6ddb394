//! Question Classifier Node
//!
//! Single-choice classification: the model picks one of the configured
//! categories and the node reports both the chosen `class_name` and the
//! `CASEi` branch handle (1-indexed over the category list).

use serde::{Deserialize, Serialize};

use mnemo_core::{ChatMessage, ChatOptions, LanguageModel, MemoryConfig};

use crate::error::{Result, WorkflowError};
use crate::pool::VariablePool;
use crate::template::render_template;

/// One classification target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierCategory {
    pub class_name: String,
}

/// Classifier node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub model_id: Option<String>,
    /// Input text; may reference pool variables
    pub input_variable: String,
    pub categories: Vec<ClassifierCategory>,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_user_prompt")]
    pub user_prompt: String,
    #[serde(default)]
    pub user_supplement_prompt: Option<String>,
}

fn default_system_prompt() -> String {
    "You are a question classifier. Pick the single best matching category for the user's \
     question and answer with the category name only."
        .to_string()
}

fn default_user_prompt() -> String {
    "Question: {question}\n\nCategories: {categories}\n\nAdditional instructions: \
     {supplement_prompt}\n\nAnswer with the best category name."
        .to_string()
}

/// Classification outcome
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub class_name: String,
    /// `CASE{i}` with `i` 1-indexed over the categories
    pub output: String,
    pub token_usage: Option<mnemo_core::TokenUsage>,
}

/// Run the classification
pub async fn run_classifier_node(
    node_id: &str,
    config: &ClassifierConfig,
    memory_config: &MemoryConfig,
    model: &dyn LanguageModel,
    pool: &VariablePool,
) -> Result<Classification> {
    if config.categories.is_empty() {
        return Err(WorkflowError::InvalidNode {
            node_id: node_id.to_string(),
            reason: "classifier has no categories".to_string(),
        });
    }

    let question = render_template(&config.input_variable, pool, false)?;
    let categories = config
        .categories
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {}", i + 1, c.class_name))
        .collect::<Vec<_>>()
        .join("\n");
    let supplement = config.user_supplement_prompt.clone().unwrap_or_default();

    let user_prompt = config
        .user_prompt
        .replace("{question}", &question)
        .replace("{categories}", &categories)
        .replace("{supplement_prompt}", &supplement);

    let model_ref = config
        .model_id
        .clone()
        .unwrap_or_else(|| memory_config.llm_model_id.clone());
    let outcome = model
        .chat(
            &model_ref,
            &[
                ChatMessage::system(config.system_prompt.clone()),
                ChatMessage::user(user_prompt),
            ],
            &ChatOptions {
                temperature: Some(0.0),
                ..Default::default()
            },
        )
        .await?;

    let index = match_category(&outcome.content, &config.categories);
    let class_name = config.categories[index].class_name.clone();
    Ok(Classification {
        output: format!("CASE{}", index + 1),
        class_name,
        token_usage: outcome.token_usage,
    })
}

/// Map model output back onto a category index
///
/// Exact name match wins, then substring containment either way, then a bare
/// number in the reply; an unmatchable reply falls back to the first
/// category.
fn match_category(reply: &str, categories: &[ClassifierCategory]) -> usize {
    let cleaned = reply.trim().trim_matches(['"', '\'', '。', '.']).trim();

    for (i, category) in categories.iter().enumerate() {
        if cleaned.eq_ignore_ascii_case(category.class_name.trim()) || cleaned == category.class_name {
            return i;
        }
    }
    for (i, category) in categories.iter().enumerate() {
        let name = category.class_name.trim();
        if cleaned.contains(name) || name.contains(cleaned) && !cleaned.is_empty() {
            return i;
        }
    }
    if let Ok(number) = cleaned
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse::<usize>()
    {
        if number >= 1 && number <= categories.len() {
            return number - 1;
        }
    }
    0
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn categories(names: &[&str]) -> Vec<ClassifierCategory> {
        names
            .iter()
            .map(|name| ClassifierCategory {
                class_name: name.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_exact_match() {
        let cats = categories(&["产品咨询", "售后服务"]);
        assert_eq!(match_category("产品咨询", &cats), 0);
        assert_eq!(match_category("售后服务", &cats), 1);
    }

    #[test]
    fn test_match_tolerates_wrapping() {
        let cats = categories(&["产品咨询", "订单查询", "售后服务", "投诉建议"]);
        assert_eq!(match_category("分类：订单查询。", &cats), 1);
        assert_eq!(match_category("\"投诉建议\"", &cats), 3);
    }

    #[test]
    fn test_numeric_reply() {
        let cats = categories(&["a", "b", "c"]);
        assert_eq!(match_category("2", &cats), 1);
        assert_eq!(match_category("option 3", &cats), 2);
        // Out-of-range numbers fall back to the first category
        assert_eq!(match_category("7", &cats), 0);
    }

    #[test]
    fn test_garbage_falls_back_to_first() {
        let cats = categories(&["alpha", "beta"]);
        assert_eq!(match_category("no idea", &cats), 0);
    }
}

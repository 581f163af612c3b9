//! Post-generation helpers: story-direction suggestions and action choices.

use crate::json::parse_json;
use crate::provider::{complete_text, Provider};
use async_trait::async_trait;
use claude::{Message, Request};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

const SUGGESTIONS_PROMPT: &str = include_str!("prompts/suggestions.txt");
const ACTION_CHOICES_PROMPT: &str = include_str!("prompts/action_choices.txt");

/// Errors from post-generation helpers. These never fail a turn.
#[derive(Debug, Error)]
pub enum PostGenError {
    #[error("Provider error: {0}")]
    Provider(#[from] claude::Error),

    #[error("Failed to parse response: {0}")]
    Parse(String),
}

/// A direction the writer could take the story next (creative-writing mode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub text: String,
    /// "action", "dialogue", "revelation", "twist", ...
    #[serde(default = "default_kind")]
    pub kind: String,
}

fn default_kind() -> String {
    "action".to_string()
}

/// Something the player could do next (adventure mode).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionChoice {
    pub text: String,
}

/// Proposes story directions.
#[async_trait]
pub trait SuggestionGenerator: Send + Sync {
    async fn suggestions(&self, narrative: &str, recent_text: &str) -> Result<Vec<Suggestion>, PostGenError>;
}

/// Proposes player actions.
#[async_trait]
pub trait ActionChoiceGenerator: Send + Sync {
    async fn action_choices(
        &self,
        narrative: &str,
        recent_text: &str,
    ) -> Result<Vec<ActionChoice>, PostGenError>;
}

#[derive(Deserialize)]
struct SuggestionsResponse {
    #[serde(default)]
    suggestions: Vec<Suggestion>,
}

#[derive(Deserialize)]
struct ChoicesResponse {
    #[serde(default)]
    choices: Vec<String>,
}

/// Model-backed generator for both suggestions and action choices.
pub struct ModelSuggestions {
    provider: Arc<dyn Provider>,
    model: Option<String>,
    count: usize,
}

impl ModelSuggestions {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            model: None,
            count: 3,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count.max(1);
        self
    }

    async fn ask(&self, system: &str, narrative: &str, recent_text: &str) -> Result<String, PostGenError> {
        let prompt = format!(
            "## Story so far\n{recent_text}\n\n## Latest passage\n{narrative}\n\nGive {} options.",
            self.count
        );
        let request = Request::new(vec![Message::user(prompt)])
            .with_system(system)
            .with_model_opt(self.model.as_deref())
            .with_max_tokens(600)
            .with_temperature(0.9);
        Ok(complete_text(self.provider.as_ref(), request).await?)
    }
}

#[async_trait]
impl SuggestionGenerator for ModelSuggestions {
    async fn suggestions(&self, narrative: &str, recent_text: &str) -> Result<Vec<Suggestion>, PostGenError> {
        let text = self.ask(SUGGESTIONS_PROMPT, narrative, recent_text).await?;
        let response: SuggestionsResponse =
            parse_json(&text).map_err(|e| PostGenError::Parse(e.to_string()))?;
        Ok(response
            .suggestions
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .take(self.count)
            .collect())
    }
}

#[async_trait]
impl ActionChoiceGenerator for ModelSuggestions {
    async fn action_choices(
        &self,
        narrative: &str,
        recent_text: &str,
    ) -> Result<Vec<ActionChoice>, PostGenError> {
        let text = self.ask(ACTION_CHOICES_PROMPT, narrative, recent_text).await?;
        let response: ChoicesResponse = parse_json(&text).map_err(|e| PostGenError::Parse(e.to_string()))?;
        Ok(response
            .choices
            .into_iter()
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .take(self.count)
            .map(|text| ActionChoice { text })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;

    #[tokio::test]
    async fn test_suggestions_default_kind_and_cap() {
        let reply = r#"{"suggestions": [
            {"text": "A stranger arrives"},
            {"text": "", "kind": "twist"},
            {"text": "The bridge collapses", "kind": "twist"},
            {"text": "Dawn breaks"}
        ]}"#;
        let generator = ModelSuggestions::new(Arc::new(MockProvider::new().with_completion(reply))).with_count(2);

        let suggestions = generator.suggestions("...", "...").await.unwrap();
        assert_eq!(
            suggestions,
            vec![
                Suggestion {
                    text: "A stranger arrives".to_string(),
                    kind: "action".to_string()
                },
                Suggestion {
                    text: "The bridge collapses".to_string(),
                    kind: "twist".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_action_choices() {
        let reply = r#"{"choices": ["Open the door", "  ", "Run"]}"#;
        let generator = ModelSuggestions::new(Arc::new(MockProvider::new().with_completion(reply)));
        let choices = generator.action_choices("...", "...").await.unwrap();
        assert_eq!(choices.len(), 2);
        assert_eq!(choices[1].text, "Run");
    }
}

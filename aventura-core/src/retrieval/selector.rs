//! Tier 3: model-mediated lore selection.

use super::RetrievalError;
use crate::json::parse_json;
use crate::provider::{complete_text, Provider};
use crate::story::{LoreEntry, LoreId};
use async_trait::async_trait;
use claude::{Message, Request};
use serde::Deserialize;
use std::sync::Arc;

const SELECTOR_PROMPT: &str = include_str!("../prompts/lore_selector.txt");

/// Picks additional lore entries the keyword tiers missed.
#[async_trait]
pub trait LoreSelector: Send + Sync {
    /// Return at most `limit` ids from `candidates`, most relevant first.
    async fn select(
        &self,
        user_input: &str,
        recent_text: &str,
        candidates: &[LoreEntry],
        limit: usize,
    ) -> Result<Vec<LoreId>, RetrievalError>;
}

#[derive(Debug, Deserialize)]
struct SelectionResponse {
    #[serde(default)]
    selected: Vec<usize>,
}

/// A [`LoreSelector`] that asks a small model to pick entries by number.
pub struct ModelLoreSelector {
    provider: Arc<dyn Provider>,
    model: Option<String>,
    max_tokens: usize,
}

impl ModelLoreSelector {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            model: None,
            max_tokens: 300,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[async_trait]
impl LoreSelector for ModelLoreSelector {
    async fn select(
        &self,
        user_input: &str,
        recent_text: &str,
        candidates: &[LoreEntry],
        limit: usize,
    ) -> Result<Vec<LoreId>, RetrievalError> {
        let listing = candidates
            .iter()
            .enumerate()
            .map(|(i, entry)| format!("{}. {}", i + 1, entry.render()))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "## Recent story\n{recent_text}\n\n## Player action\n{user_input}\n\n\
             ## Candidate entries\n{listing}\n\nSelect at most {limit} entries."
        );

        let request = Request::new(vec![Message::user(prompt)])
            .with_system(SELECTOR_PROMPT)
            .with_model_opt(self.model.as_deref())
            .with_max_tokens(self.max_tokens)
            .with_temperature(0.0);

        let text = complete_text(self.provider.as_ref(), request).await?;
        let response: SelectionResponse =
            parse_json(&text).map_err(|e| RetrievalError::Parse(e.to_string()))?;

        Ok(response
            .selected
            .into_iter()
            .filter_map(|n| n.checked_sub(1).and_then(|i| candidates.get(i)))
            .map(|entry| entry.id)
            .take(limit)
            .collect())
    }
}

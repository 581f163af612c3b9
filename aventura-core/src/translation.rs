//! Translation of narration, entity names and suggestions.

use crate::json::parse_json;
use crate::provider::{complete_text, Provider};
use async_trait::async_trait;
use claude::{Message, Request};
use std::sync::Arc;
use thiserror::Error;

const TRANSLATOR_PROMPT: &str = include_str!("prompts/translator.txt");

/// Errors from translation. Translation failures never fail a turn.
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("Provider error: {0}")]
    Provider(#[from] claude::Error),

    #[error("Failed to parse translation: {0}")]
    Parse(String),

    #[error("Expected {expected} translations, got {got}")]
    Mismatch { expected: usize, got: usize },
}

/// Translates text into a target language.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, target_language: &str) -> Result<String, TranslationError>;

    /// Translate several short texts, returning them in the same order.
    async fn translate_batch(
        &self,
        texts: &[String],
        target_language: &str,
    ) -> Result<Vec<String>, TranslationError> {
        let mut translated = Vec::with_capacity(texts.len());
        for text in texts {
            translated.push(self.translate(text, target_language).await?);
        }
        Ok(translated)
    }
}

/// A [`Translator`] backed by a model.
pub struct ModelTranslator {
    provider: Arc<dyn Provider>,
    model: Option<String>,
}

impl ModelTranslator {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    fn request(&self, prompt: String, max_tokens: usize) -> Request {
        Request::new(vec![Message::user(prompt)])
            .with_system(TRANSLATOR_PROMPT)
            .with_model_opt(self.model.as_deref())
            .with_max_tokens(max_tokens)
            .with_temperature(0.0)
    }
}

#[async_trait]
impl Translator for ModelTranslator {
    async fn translate(&self, text: &str, target_language: &str) -> Result<String, TranslationError> {
        let prompt = format!("Translate into {target_language}. Reply with the translation only.\n\n{text}");
        let max_tokens = (text.len() / 2).clamp(256, 4096);
        let translated = complete_text(self.provider.as_ref(), self.request(prompt, max_tokens)).await?;
        Ok(translated.trim().to_string())
    }

    async fn translate_batch(
        &self,
        texts: &[String],
        target_language: &str,
    ) -> Result<Vec<String>, TranslationError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let payload = serde_json::to_string(texts).map_err(|e| TranslationError::Parse(e.to_string()))?;
        let prompt = format!(
            "Translate each string of this JSON array into {target_language}. \
             Reply with a JSON array of the same length and order.\n\n{payload}"
        );
        let text = complete_text(self.provider.as_ref(), self.request(prompt, 2048)).await?;
        let translated: Vec<String> =
            parse_json(&text).map_err(|e| TranslationError::Parse(e.to_string()))?;

        if translated.len() != texts.len() {
            return Err(TranslationError::Mismatch {
                expected: texts.len(),
                got: translated.len(),
            });
        }
        Ok(translated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;

    #[tokio::test]
    async fn test_translate_trims() {
        let provider = Arc::new(MockProvider::new().with_completion("  La puerta cruje.\n"));
        let translator = ModelTranslator::new(provider);
        let text = translator.translate("The door creaks.", "Spanish").await.unwrap();
        assert_eq!(text, "La puerta cruje.");
    }

    #[tokio::test]
    async fn test_batch_length_mismatch() {
        let provider = Arc::new(MockProvider::new().with_completion(r#"["uno"]"#));
        let translator = ModelTranslator::new(provider);
        let result = translator
            .translate_batch(&["one".to_string(), "two".to_string()], "Spanish")
            .await;
        assert!(matches!(result, Err(TranslationError::Mismatch { expected: 2, got: 1 })));
    }
}

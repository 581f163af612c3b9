//! Timeline fill: a cheaper alternative to agentic retrieval.
//!
//! One model call proposes up to three questions about chapter ranges; each is
//! answered through a [`ChapterQuery`] and the answers become prompt context.

use super::RetrievalError;
use crate::agentic::ChapterQuery;
use crate::json::parse_json;
use crate::provider::{complete_text, Provider};
use crate::story::{chapter_listing, clamp_range, Chapter};
use async_trait::async_trait;
use claude::{Message, Request};
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const TIMELINE_PROMPT: &str = include_str!("../prompts/timeline_fill.txt");

/// Most questions asked per turn.
pub const MAX_TIMELINE_QUERIES: usize = 3;

/// Widest chapter range one question may cover.
pub const MAX_QUERY_SPAN: u32 = 3;

/// Gathers historical context from earlier chapters.
#[async_trait]
pub trait TimelineFill: Send + Sync {
    /// Return context for the prompt; empty when nothing useful was found.
    async fn fill(
        &self,
        user_input: &str,
        recent_text: &str,
        chapters: &[Chapter],
        queries: &dyn ChapterQuery,
        cancel: &CancellationToken,
    ) -> Result<String, RetrievalError>;
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct TimelineQuestion {
    start_chapter: u32,
    #[serde(default)]
    end_chapter: Option<u32>,
    question: String,
}

#[derive(Debug, Deserialize)]
struct TimelinePlan {
    #[serde(default)]
    queries: Vec<TimelineQuestion>,
}

/// A [`TimelineFill`] that plans its questions with a model.
pub struct ModelTimelineFill {
    provider: Arc<dyn Provider>,
    model: Option<String>,
}

impl ModelTimelineFill {
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

    async fn plan(
        &self,
        user_input: &str,
        recent_text: &str,
        chapters: &[Chapter],
    ) -> Result<Vec<TimelineQuestion>, RetrievalError> {
        let prompt = format!(
            "## Chapters\n{}\n\n## Recent story\n{recent_text}\n\n## Player action\n{user_input}",
            chapter_listing(chapters)
        );
        let request = Request::new(vec![Message::user(prompt)])
            .with_system(TIMELINE_PROMPT)
            .with_model_opt(self.model.as_deref())
            .with_max_tokens(500)
            .with_temperature(0.0);

        let text = complete_text(self.provider.as_ref(), request).await?;
        let plan: TimelinePlan = parse_json(&text).map_err(|e| RetrievalError::Parse(e.to_string()))?;
        Ok(plan.queries)
    }
}

#[async_trait]
impl TimelineFill for ModelTimelineFill {
    async fn fill(
        &self,
        user_input: &str,
        recent_text: &str,
        chapters: &[Chapter],
        queries: &dyn ChapterQuery,
        cancel: &CancellationToken,
    ) -> Result<String, RetrievalError> {
        if chapters.is_empty() {
            return Ok(String::new());
        }

        let plan = tokio::select! {
            _ = cancel.cancelled() => return Ok(String::new()),
            plan = self.plan(user_input, recent_text, chapters) => plan?,
        };
        debug!(questions = plan.len(), "Planned timeline questions");

        let mut answers = Vec::new();
        for question in plan.into_iter().take(MAX_TIMELINE_QUERIES) {
            if cancel.is_cancelled() {
                break;
            }
            let end = question.end_chapter.unwrap_or(question.start_chapter);
            let Some((start, end)) = clamp_range(chapters, question.start_chapter, end, MAX_QUERY_SPAN)
            else {
                debug!(start = question.start_chapter, end, "Skipping question outside known chapters");
                continue;
            };

            let answer = if start == end {
                queries.query_chapter(start, &question.question).await
            } else {
                queries.query_chapters(start, end, &question.question).await
            };

            match answer {
                Ok(answer) if !answer.trim().is_empty() => {
                    answers.push(format!(
                        "Chapters {start}-{end}: {}\n{}",
                        question.question,
                        answer.trim()
                    ));
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, start, end, "Timeline question failed"),
            }
        }

        Ok(answers.join("\n\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockProvider, ScriptedChapterQuery};

    fn chapters() -> Vec<Chapter> {
        (1..=6)
            .map(|n| Chapter::new(n, format!("Part {n}"), "Events"))
            .collect()
    }

    #[tokio::test]
    async fn test_fill_clamps_and_caps_questions() {
        let plan = r#"{"queries": [
            {"start_chapter": 1, "end_chapter": 6, "question": "Who betrayed us?"},
            {"start_chapter": 4, "question": "Where is the map?"},
            {"start_chapter": 9, "end_chapter": 12, "question": "Out of range"},
            {"start_chapter": 2, "end_chapter": 2, "question": "Dropped by cap"}
        ]}"#;
        let provider = Arc::new(MockProvider::new().with_completion(plan));
        let queries = ScriptedChapterQuery::new("An answer");
        let fill = ModelTimelineFill::new(provider);

        let context = fill
            .fill("go", "", &chapters(), &queries, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            queries.calls(),
            vec![
                (1, 3, "Who betrayed us?".to_string()),
                (4, 4, "Where is the map?".to_string()),
            ]
        );
        assert!(context.contains("Chapters 1-3: Who betrayed us?"));
    }

    #[tokio::test]
    async fn test_fill_without_chapters_is_empty() {
        let provider = Arc::new(MockProvider::new());
        let fill = ModelTimelineFill::new(provider.clone());
        let queries = ScriptedChapterQuery::new("unused");

        let context = fill
            .fill("go", "", &[], &queries, &CancellationToken::new())
            .await
            .unwrap();
        assert!(context.is_empty());
        assert!(provider.requests().is_empty());
    }
}

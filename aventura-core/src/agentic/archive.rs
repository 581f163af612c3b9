//! Answering chapter questions from stored chapter text.

use super::{AgenticError, ChapterQuery};
use crate::provider::{complete_text, Provider};
use crate::story::Chapter;
use async_trait::async_trait;
use claude::{Message, Request};
use std::collections::BTreeMap;
use std::sync::Arc;

const CHAPTER_QUERY_PROMPT: &str = include_str!("../prompts/chapter_query.txt");

/// A [`ChapterQuery`] that reads stored chapter text and asks a model about it.
pub struct ChapterArchive {
    provider: Arc<dyn Provider>,
    model: Option<String>,
    chapters: BTreeMap<u32, (Chapter, String)>,
}

impl ChapterArchive {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            model: None,
            chapters: BTreeMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Store a chapter's full text.
    pub fn with_chapter(mut self, chapter: Chapter, text: impl Into<String>) -> Self {
        self.chapters.insert(chapter.number, (chapter, text.into()));
        self
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    fn section(&self, number: u32) -> Result<String, AgenticError> {
        let (chapter, text) = self
            .chapters
            .get(&number)
            .ok_or_else(|| AgenticError::Query(format!("Chapter {number} is not in the archive")))?;
        Ok(format!("## Chapter {}: {}\n{}", chapter.number, chapter.title, text))
    }

    async fn ask(&self, material: String, question: &str) -> Result<String, AgenticError> {
        let prompt = format!("{material}\n\n## Question\n{question}");
        let request = Request::new(vec![Message::user(prompt)])
            .with_system(CHAPTER_QUERY_PROMPT)
            .with_model_opt(self.model.as_deref())
            .with_max_tokens(600)
            .with_temperature(0.0);
        Ok(complete_text(self.provider.as_ref(), request).await?)
    }
}

#[async_trait]
impl ChapterQuery for ChapterArchive {
    async fn query_chapter(&self, number: u32, question: &str) -> Result<String, AgenticError> {
        let material = self.section(number)?;
        self.ask(material, question).await
    }

    async fn query_chapters(&self, start: u32, end: u32, question: &str) -> Result<String, AgenticError> {
        let sections = (start..=end)
            .filter(|n| self.chapters.contains_key(n))
            .map(|n| self.section(n))
            .collect::<Result<Vec<_>, _>>()?;
        if sections.is_empty() {
            return Err(AgenticError::Query(format!(
                "Chapters {start}-{end} are not in the archive"
            )));
        }
        self.ask(sections.join("\n\n"), question).await
    }
}

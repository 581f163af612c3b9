//! The agentic retrieval loop.
//!
//! A sub-agent is given the player's action and recent story, and queries the
//! chapter archive through [`RetrievalTools`] until it calls `finish_retrieval`,
//! stops calling tools, runs out of iterations, or is cancelled.

use super::tool_calls::{FinishedToolCall, ToolCallAccumulator};
use super::tools::{parse_tool_call, RetrievalToolCall, RetrievalTools};
use super::{AgenticError, ChapterQuery};
use crate::provider::Provider;
use crate::story::{chapter_listing, clamp_range, transcript, Chapter, LoreEntry, LoreType, StoryEntry};
use claude::{ContentBlock, Message, Request, Role, StreamChunk};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const AGENT_PROMPT: &str = include_str!("../prompts/agentic_retrieval.txt");

const NUDGE: &str = "You did not call a tool. Use the tools to look up what you need, \
                     or call finish_retrieval with a summary of what you found.";

/// Widest chapter range `query_chapters` reads.
pub const MAX_CHAPTER_SPAN: u32 = 3;

/// Configuration for the retrieval sub-agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgenticConfig {
    /// Hard cap on model turns.
    pub max_iterations: usize,
    pub model: Option<String>,
    pub max_tokens: usize,
    pub temperature: Option<f32>,
    /// Recent story entries shown to the agent.
    pub recent_window: usize,
}

impl Default for AgenticConfig {
    fn default() -> Self {
        Self {
            max_iterations: 6,
            model: None,
            max_tokens: 1024,
            temperature: Some(0.2),
            recent_window: 6,
        }
    }
}

impl AgenticConfig {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// What the agent gets to work with.
#[derive(Debug, Clone, Copy)]
pub struct AgenticContext<'a> {
    pub user_input: &'a str,
    pub recent_entries: &'a [StoryEntry],
    pub chapters: &'a [Chapter],
    pub entries: &'a [LoreEntry],
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The model called `finish_retrieval`.
    Finished,
    IterationCap,
    /// Two consecutive turns without a tool call.
    NoToolCalls,
    Cancelled,
    /// The provider failed; accumulated findings are returned.
    ProviderError,
}

/// Outcome of one retrieval session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgenticRetrievalResult {
    pub context: String,
    /// Chapters queried, in first-query order, without duplicates.
    pub queried_chapters: Vec<u32>,
    pub iterations: usize,
    pub session_id: String,
    pub terminated_by: Termination,
}

/// What one tool call produced.
enum ToolOutcome {
    Content(String),
    Error(String),
    Finish(String),
}

/// Running state of one session.
struct Session {
    findings: Vec<String>,
    queried_chapters: Vec<u32>,
}

impl Session {
    fn mark_queried(&mut self, chapters: impl IntoIterator<Item = u32>) {
        for number in chapters {
            if !self.queried_chapters.contains(&number) {
                self.queried_chapters.push(number);
            }
        }
    }

    fn accumulated(&self) -> String {
        self.findings.join("\n\n")
    }
}

/// One model turn, decoded from the stream.
struct ModelTurn {
    text: String,
    calls: Vec<FinishedToolCall>,
}

/// The retrieval sub-agent.
pub struct AgenticRetrieval {
    provider: Arc<dyn Provider>,
    config: AgenticConfig,
}

impl AgenticRetrieval {
    pub fn new(provider: Arc<dyn Provider>, config: AgenticConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &AgenticConfig {
        &self.config
    }

    /// Run the loop to completion. Never fails; failures end the session with
    /// whatever was found so far.
    #[tracing::instrument(skip_all, fields(chapters = context.chapters.len()))]
    pub async fn run_retrieval(
        &self,
        context: &AgenticContext<'_>,
        queries: &dyn ChapterQuery,
        cancel: &CancellationToken,
    ) -> AgenticRetrievalResult {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut session = Session {
            findings: Vec::new(),
            queried_chapters: Vec::new(),
        };
        let mut messages = vec![Message::user(self.initial_prompt(context))];
        let mut iterations = 0;
        let mut previous_turn_idle = false;

        let (terminated_by, summary) = loop {
            if iterations >= self.config.max_iterations {
                break (Termination::IterationCap, None);
            }
            if cancel.is_cancelled() {
                break (Termination::Cancelled, None);
            }
            iterations += 1;

            let turn = tokio::select! {
                _ = cancel.cancelled() => break (Termination::Cancelled, None),
                turn = self.model_turn(&messages) => turn,
            };
            let turn = match turn {
                Ok(turn) => turn,
                Err(e) => {
                    warn!(error = %e, iterations, "Agentic retrieval aborted by provider error");
                    break (Termination::ProviderError, None);
                }
            };

            if turn.calls.is_empty() {
                if previous_turn_idle {
                    break (Termination::NoToolCalls, None);
                }
                debug!(iterations, "No tool call, nudging");
                previous_turn_idle = true;
                if !turn.text.trim().is_empty() {
                    messages.push(Message::assistant(turn.text));
                }
                messages.push(Message::user(NUDGE));
                continue;
            }
            previous_turn_idle = false;

            let mut blocks = Vec::new();
            if !turn.text.trim().is_empty() {
                blocks.push(ContentBlock::Text { text: turn.text });
            }
            blocks.extend(turn.calls.iter().map(FinishedToolCall::to_block));
            messages.push(Message {
                role: Role::Assistant,
                content: blocks,
            });

            let mut finished = None;
            for call in &turn.calls {
                debug!(tool = %call.name, id = %call.id, "Executing retrieval tool");
                let outcome = self.execute(call, context, queries, &mut session).await;
                let (content, is_error) = match outcome {
                    ToolOutcome::Content(content) => (content, false),
                    ToolOutcome::Error(message) => (message, true),
                    ToolOutcome::Finish(summary) => {
                        finished = Some(summary);
                        ("Retrieval finished.".to_string(), false)
                    }
                };
                messages.push(Message::tool_result(&call.id, content, is_error));
            }

            if let Some(summary) = finished {
                break (Termination::Finished, Some(summary));
            }
        };

        let context = match summary {
            Some(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            _ => session.accumulated(),
        };

        info!(
            iterations,
            terminated_by = ?terminated_by,
            queried = session.queried_chapters.len(),
            "Agentic retrieval complete"
        );

        AgenticRetrievalResult {
            context,
            queried_chapters: session.queried_chapters,
            iterations,
            session_id,
            terminated_by,
        }
    }

    fn initial_prompt(&self, context: &AgenticContext<'_>) -> String {
        format!(
            "## Chapters available\n{}\n\n## Recent story\n{}\n\n## Player action\n{}",
            chapter_listing(context.chapters),
            transcript(context.recent_entries, self.config.recent_window),
            context.user_input
        )
    }

    async fn model_turn(&self, messages: &[Message]) -> Result<ModelTurn, AgenticError> {
        let mut request = Request::new(messages.to_vec())
            .with_system(AGENT_PROMPT)
            .with_model_opt(self.config.model.as_deref())
            .with_max_tokens(self.config.max_tokens)
            .with_tools(RetrievalTools::all());
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }

        let mut stream = self.provider.stream_with_tools(request).await?;
        let mut text = String::new();
        let mut accumulator = ToolCallAccumulator::new();

        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Content { text: delta } => text.push_str(&delta),
                StreamChunk::Reasoning { .. } => {}
                StreamChunk::Done { .. } => break,
                other => accumulator.push(&other),
            }
        }

        Ok(ModelTurn {
            text,
            calls: accumulator.finish(),
        })
    }

    async fn execute(
        &self,
        call: &FinishedToolCall,
        context: &AgenticContext<'_>,
        queries: &dyn ChapterQuery,
        session: &mut Session,
    ) -> ToolOutcome {
        let input = match &call.input {
            Ok(input) => input,
            Err(message) => return ToolOutcome::Error(message.clone()),
        };
        let tool = match parse_tool_call(&call.name, input) {
            Ok(tool) => tool,
            Err(e) => return ToolOutcome::Error(e.to_string()),
        };

        match tool {
            RetrievalToolCall::ListChapters => ToolOutcome::Content(chapter_listing(context.chapters)),
            RetrievalToolCall::QueryChapter(args) => {
                if !context.chapters.iter().any(|c| c.number == args.chapter_number) {
                    return ToolOutcome::Error(format!(
                        "Chapter {} does not exist ({} chapters available)",
                        args.chapter_number,
                        context.chapters.len()
                    ));
                }
                match queries.query_chapter(args.chapter_number, &args.question).await {
                    Ok(answer) => {
                        session.mark_queried([args.chapter_number]);
                        session.findings.push(format!(
                            "Chapter {}: {}\n{}",
                            args.chapter_number,
                            args.question,
                            answer.trim()
                        ));
                        ToolOutcome::Content(answer)
                    }
                    Err(e) => ToolOutcome::Error(e.to_string()),
                }
            }
            RetrievalToolCall::QueryChapters(args) => {
                let Some((start, end)) =
                    clamp_range(context.chapters, args.start_chapter, args.end_chapter, MAX_CHAPTER_SPAN)
                else {
                    return ToolOutcome::Error(format!(
                        "Chapters {}-{} do not exist ({} chapters available)",
                        args.start_chapter,
                        args.end_chapter,
                        context.chapters.len()
                    ));
                };
                match queries.query_chapters(start, end, &args.question).await {
                    Ok(answer) => {
                        session.mark_queried(start..=end);
                        session.findings.push(format!(
                            "Chapters {start}-{end}: {}\n{}",
                            args.question,
                            answer.trim()
                        ));
                        ToolOutcome::Content(answer)
                    }
                    Err(e) => ToolOutcome::Error(e.to_string()),
                }
            }
            RetrievalToolCall::ListEntries(args) => {
                let filter = match args.type_filter.as_deref().map(str::trim) {
                    None | Some("") => None,
                    Some(name) => match LoreType::parse(name) {
                        Some(entry_type) => Some(entry_type),
                        None => return ToolOutcome::Error(format!("Unknown entry type: {name}")),
                    },
                };
                ToolOutcome::Content(list_entries(context.entries, filter))
            }
            RetrievalToolCall::Finish(args) => ToolOutcome::Finish(args.summary),
        }
    }
}

fn list_entries(entries: &[LoreEntry], filter: Option<LoreType>) -> String {
    let lines: Vec<String> = entries
        .iter()
        .filter(|e| filter.map_or(true, |t| e.entry_type == t))
        .map(|e| format!("- {}", e.render()))
        .collect();
    if lines.is_empty() {
        "No entries.".to_string()
    } else {
        lines.join("\n")
    }
}

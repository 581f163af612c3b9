//! Agentic retrieval: a tool-calling sub-agent that reads old chapters.

mod agent;
mod archive;
mod tool_calls;
mod tools;

pub use agent::{
    AgenticConfig, AgenticContext, AgenticRetrieval, AgenticRetrievalResult, Termination,
    MAX_CHAPTER_SPAN,
};
pub use archive::ChapterArchive;
pub use tool_calls::{FinishedToolCall, PendingToolCall, ToolCallAccumulator};
pub use tools::{
    parse_tool_call, FinishRetrieval, ListChapters, ListEntries, QueryChapter, QueryChapters,
    RetrievalToolCall, RetrievalTools,
};

use async_trait::async_trait;
use thiserror::Error;

/// Errors from tool execution and chapter queries.
#[derive(Debug, Error)]
pub enum AgenticError {
    #[error("Provider error: {0}")]
    Provider(#[from] claude::Error),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Chapter query failed: {0}")]
    Query(String),
}

/// Answers questions about chapter text.
#[async_trait]
pub trait ChapterQuery: Send + Sync {
    async fn query_chapter(&self, number: u32, question: &str) -> Result<String, AgenticError>;

    /// Ask one question across the inclusive range `start..=end`.
    async fn query_chapters(&self, start: u32, end: u32, question: &str) -> Result<String, AgenticError>;
}

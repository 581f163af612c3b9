//! The fixed tool surface of the agentic retrieval loop.

use super::AgenticError;
use aventura_macros::Tool;
use claude::ToolSpec;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// List every chapter with its number, title, summary, characters and locations. Returns metadata only, never chapter text.
#[derive(Debug, Clone, Default, PartialEq, Tool, Deserialize)]
#[tool(name = "list_chapters")]
pub struct ListChapters {}

/// Ask a question about a single chapter. The answer is drawn from the chapter's full text.
#[derive(Debug, Clone, PartialEq, Tool, Deserialize)]
#[tool(name = "query_chapter")]
pub struct QueryChapter {
    /// Chapter number, starting at 1
    #[tool(minimum = 1)]
    pub chapter_number: u32,
    /// What you want to know
    pub question: String,
}

/// Ask one question across a range of chapters (at most 3 chapters are read).
#[derive(Debug, Clone, PartialEq, Tool, Deserialize)]
#[tool(name = "query_chapters")]
pub struct QueryChapters {
    /// First chapter of the range
    #[tool(minimum = 1)]
    pub start_chapter: u32,
    /// Last chapter of the range (inclusive)
    #[tool(minimum = 1)]
    pub end_chapter: u32,
    /// What you want to know
    pub question: String,
}

/// List lorebook entries, optionally only those of one type (character, location, item, faction, concept, event).
#[derive(Debug, Clone, Default, PartialEq, Tool, Deserialize)]
#[tool(name = "list_entries")]
pub struct ListEntries {
    /// Entry type to keep
    pub type_filter: Option<String>,
}

/// Finish retrieval and hand back a summary of everything relevant you found.
#[derive(Debug, Clone, PartialEq, Tool, Deserialize)]
#[tool(name = "finish_retrieval")]
pub struct FinishRetrieval {
    /// Concise summary of the relevant history for the next scene
    #[serde(default)]
    pub summary: String,
}

/// A parsed call to one of the retrieval tools.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalToolCall {
    ListChapters,
    QueryChapter(QueryChapter),
    QueryChapters(QueryChapters),
    ListEntries(ListEntries),
    Finish(FinishRetrieval),
}

/// Tool definitions offered to the model.
pub struct RetrievalTools;

impl RetrievalTools {
    pub fn all() -> Vec<claude::Tool> {
        vec![
            ListChapters::as_tool(),
            QueryChapter::as_tool(),
            QueryChapters::as_tool(),
            ListEntries::as_tool(),
            FinishRetrieval::as_tool(),
        ]
    }
}

fn arguments<T: DeserializeOwned>(tool: &str, input: &Value) -> Result<T, AgenticError> {
    serde_json::from_value(input.clone()).map_err(|e| AgenticError::InvalidArguments {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

/// Parse a tool call from the model.
pub fn parse_tool_call(name: &str, input: &Value) -> Result<RetrievalToolCall, AgenticError> {
    match name {
        "list_chapters" => Ok(RetrievalToolCall::ListChapters),
        "query_chapter" => arguments(name, input).map(RetrievalToolCall::QueryChapter),
        "query_chapters" => arguments(name, input).map(RetrievalToolCall::QueryChapters),
        "list_entries" => arguments(name, input).map(RetrievalToolCall::ListEntries),
        "finish_retrieval" => arguments(name, input).map(RetrievalToolCall::Finish),
        other => Err(AgenticError::UnknownTool(other.to_string())),
    }
}

//! Merging streamed tool-call deltas.
//!
//! A streamed turn announces each call with `ToolCallStart { index, .. }` and then
//! sends its JSON arguments in fragments keyed by the same index. Fragments for
//! different indices may interleave; within an index they arrive in order.

use claude::{ContentBlock, StreamChunk};
use serde_json::Value;
use std::collections::BTreeMap;

/// A tool call still receiving argument fragments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// A completed tool call. `input` is an error message when the arguments were not JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedToolCall {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub input: Result<Value, String>,
}

impl FinishedToolCall {
    /// The assistant content block that records this call in the transcript.
    pub fn to_block(&self) -> ContentBlock {
        ContentBlock::ToolUse {
            id: self.id.clone(),
            name: self.name.clone(),
            input: self.input.clone().unwrap_or_else(|_| Value::Object(Default::default())),
        }
    }
}

/// Ordered accumulator of tool calls by stream index.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, PendingToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Feed one stream chunk. Non-tool chunks are ignored.
    pub fn push(&mut self, chunk: &StreamChunk) {
        match chunk {
            StreamChunk::ToolCallStart { index, id, name } => {
                let call = self.calls.entry(*index).or_default();
                call.id = id.clone();
                call.name = name.clone();
            }
            StreamChunk::ToolCallArgs { index, delta } => {
                self.calls.entry(*index).or_default().arguments.push_str(delta);
            }
            _ => {}
        }
    }

    /// Finalize all calls, sorted by index.
    pub fn finish(self) -> Vec<FinishedToolCall> {
        self.calls
            .into_iter()
            .map(|(index, call)| {
                let raw = call.arguments.trim();
                let input = if raw.is_empty() {
                    Ok(Value::Object(Default::default()))
                } else {
                    serde_json::from_str(raw).map_err(|e| format!("Invalid JSON arguments: {e}"))
                };
                let id = if call.id.is_empty() {
                    format!("call_{index}")
                } else {
                    call.id
                };
                FinishedToolCall {
                    index,
                    id,
                    name: call.name,
                    input,
                }
            })
            .collect()
    }
}

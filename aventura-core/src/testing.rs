//! Test doubles for the core's collaborators.
//!
//! - [`MockProvider`] scripts completions and streamed turns (including stalls,
//!   mid-stream failures and tool calls) and records every request
//! - [`ScriptedChapterQuery`], [`ScriptedClassifier`], [`ScriptedTranslator`] and
//!   [`ScriptedSuggestions`] stand in for the model-backed helpers
//! - [`MemoryStore`] and [`RecordingUi`] implement the persistence and UI seams;
//!   the store can also slow down reads and fail entity deletes on demand

use crate::agentic::{AgenticError, ChapterQuery};
use crate::classifier::{ClassificationResult, Classifier, ClassifierError};
use crate::pipeline::{PipelineEvent, PipelineStream};
use crate::provider::Provider;
use crate::store::{StoreError, StoryStore, UiOps};
use crate::story::{Chapter, EntryId, LoreEntry, StoryEntry, StoryId, TimeTracker, WorldState};
use crate::suggestions::{ActionChoice, ActionChoiceGenerator, PostGenError, Suggestion, SuggestionGenerator};
use crate::translation::{TranslationError, Translator};
use async_trait::async_trait;
use claude::{ChunkStream, ContentBlock, Request, Response, StopReason, StreamChunk, Usage};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drain a pipeline stream.
pub async fn collect_events(stream: PipelineStream) -> Vec<PipelineEvent> {
    stream.collect().await
}

// ============================================================================
// Provider
// ============================================================================

#[derive(Debug, Clone)]
enum MockStep {
    Chunk(StreamChunk),
    Fail(String),
    /// Never yields again.
    Stall,
}

/// One scripted streamed response.
#[derive(Debug, Clone)]
pub struct MockTurn {
    steps: Vec<MockStep>,
    open_error: Option<String>,
    next_tool_index: usize,
}

impl MockTurn {
    fn from_chunks(chunks: Vec<StreamChunk>) -> Self {
        Self {
            steps: chunks.into_iter().map(MockStep::Chunk).collect(),
            open_error: None,
            next_tool_index: 0,
        }
    }

    fn done(stop_reason: StopReason) -> StreamChunk {
        StreamChunk::Done {
            stop_reason: Some(stop_reason),
        }
    }

    /// A plain text reply in one chunk.
    pub fn text(text: impl Into<String>) -> Self {
        let text: String = text.into();
        Self::chunks([text])
    }

    /// A text reply split into the given deltas.
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all: Vec<StreamChunk> = chunks
            .into_iter()
            .map(|text| StreamChunk::Content { text: text.into() })
            .collect();
        all.push(Self::done(StopReason::EndTurn));
        Self::from_chunks(all)
    }

    /// A reply consisting of one tool call.
    pub fn tool_call(name: &str, input: serde_json::Value) -> Self {
        Self::from_chunks(vec![Self::done(StopReason::ToolUse)]).and_tool_call(name, input)
    }

    /// Add another tool call before the end of the turn.
    ///
    /// Arguments are split in two deltas to exercise merging.
    pub fn and_tool_call(mut self, name: &str, input: serde_json::Value) -> Self {
        let index = self.next_tool_index;
        self.next_tool_index += 1;

        let args = input.to_string();
        let split = args.len() / 2;
        let split = (split..=args.len()).find(|&i| args.is_char_boundary(i)).unwrap_or(args.len());
        let (head, tail) = args.split_at(split);

        let calls = [
            StreamChunk::ToolCallStart {
                index,
                id: format!("call_{index}"),
                name: name.to_string(),
            },
            StreamChunk::ToolCallArgs {
                index,
                delta: head.to_string(),
            },
            StreamChunk::ToolCallArgs {
                index,
                delta: tail.to_string(),
            },
        ];
        let at = self.end_position();
        self.steps.splice(at..at, calls.into_iter().map(MockStep::Chunk));
        self
    }

    /// The request itself fails.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            steps: Vec::new(),
            open_error: Some(message.into()),
            next_tool_index: 0,
        }
    }

    /// Prepend a reasoning delta.
    pub fn with_reasoning(mut self, text: impl Into<String>) -> Self {
        self.steps
            .insert(0, MockStep::Chunk(StreamChunk::Reasoning { text: text.into() }));
        self
    }

    /// Replace the end of the turn with a stall: the stream stays open forever.
    pub fn then_stall(mut self) -> Self {
        self.truncate_done();
        self.steps.push(MockStep::Stall);
        self
    }

    /// Replace the end of the turn with a transport failure.
    pub fn then_fail(mut self, message: impl Into<String>) -> Self {
        self.truncate_done();
        self.steps.push(MockStep::Fail(message.into()));
        self
    }

    fn end_position(&self) -> usize {
        match self.steps.last() {
            Some(MockStep::Chunk(StreamChunk::Done { .. })) => self.steps.len() - 1,
            _ => self.steps.len(),
        }
    }

    fn truncate_done(&mut self) {
        let end = self.end_position();
        self.steps.truncate(end);
    }

    fn into_stream(self) -> ChunkStream {
        let stream = futures::stream::unfold(self.steps.into_iter(), |mut steps| async move {
            match steps.next()? {
                MockStep::Chunk(chunk) => Some((Ok(chunk), steps)),
                MockStep::Fail(message) => Some((Err(claude::Error::Stream(message)), steps)),
                MockStep::Stall => {
                    futures::future::pending::<()>().await;
                    None
                }
            }
        });
        Box::pin(stream)
    }
}

/// A scripted [`Provider`].
///
/// Completions and streamed turns are consumed in order. Running out of script
/// is an API error, so tests notice unexpected calls.
#[derive(Default)]
pub struct MockProvider {
    completions: Mutex<VecDeque<Result<String, String>>>,
    turns: Mutex<VecDeque<MockTurn>>,
    requests: Mutex<Vec<Request>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_completion(self, text: impl Into<String>) -> Self {
        lock(&self.completions).push_back(Ok(text.into()));
        self
    }

    pub fn with_completion_error(self, message: impl Into<String>) -> Self {
        lock(&self.completions).push_back(Err(message.into()));
        self
    }

    pub fn with_turn(self, turn: MockTurn) -> Self {
        lock(&self.turns).push_back(turn);
        self
    }

    /// Every request received so far, completions and streams alike.
    pub fn requests(&self) -> Vec<Request> {
        lock(&self.requests).clone()
    }

    fn exhausted() -> claude::Error {
        claude::Error::Api {
            status: 500,
            message: "no scripted response left".to_string(),
        }
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(&self, request: Request) -> Result<Response, claude::Error> {
        lock(&self.requests).push(request);
        let next = lock(&self.completions).pop_front().ok_or_else(Self::exhausted)?;
        let text = next.map_err(|message| claude::Error::Api { status: 529, message })?;

        Ok(Response {
            id: "msg_mock".to_string(),
            model: "mock".to_string(),
            content: vec![ContentBlock::Text { text }],
            stop_reason: StopReason::EndTurn,
            usage: Usage {
                input_tokens: 0,
                output_tokens: 0,
            },
        })
    }

    async fn stream_with_tools(&self, request: Request) -> Result<ChunkStream, claude::Error> {
        lock(&self.requests).push(request);
        let turn = lock(&self.turns).pop_front().ok_or_else(Self::exhausted)?;
        if let Some(message) = turn.open_error {
            return Err(claude::Error::Api { status: 529, message });
        }
        Ok(turn.into_stream())
    }
}

// ============================================================================
// Scripted helpers
// ============================================================================

/// Answers every chapter question with the same text and logs the calls as
/// `(start, end, question)`.
pub struct ScriptedChapterQuery {
    answer: String,
    calls: Mutex<Vec<(u32, u32, String)>>,
}

impl ScriptedChapterQuery {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(u32, u32, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ChapterQuery for ScriptedChapterQuery {
    async fn query_chapter(&self, number: u32, question: &str) -> Result<String, AgenticError> {
        lock(&self.calls).push((number, number, question.to_string()));
        Ok(self.answer.clone())
    }

    async fn query_chapters(&self, start: u32, end: u32, question: &str) -> Result<String, AgenticError> {
        lock(&self.calls).push((start, end, question.to_string()));
        Ok(self.answer.clone())
    }
}

/// Returns a fixed classification, or fails with a fixed message.
pub struct ScriptedClassifier {
    result: Result<ClassificationResult, String>,
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn new(result: ClassificationResult) -> Self {
        Self {
            result: Ok(result),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedClassifier {
    fn default() -> Self {
        Self::new(ClassificationResult::default())
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        _narrative: &str,
        _user_action: &str,
        _world: &WorldState,
    ) -> Result<ClassificationResult, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone().map_err(ClassifierError::Failed)
    }
}

/// "Translates" by tagging text with the target language: `[es] hola`.
#[derive(Default)]
pub struct ScriptedTranslator {
    fail: bool,
}

impl ScriptedTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl Translator for ScriptedTranslator {
    async fn translate(&self, text: &str, target_language: &str) -> Result<String, TranslationError> {
        if self.fail {
            return Err(TranslationError::Parse("scripted failure".to_string()));
        }
        Ok(format!("[{target_language}] {text}"))
    }
}

/// Fixed suggestions and action choices. An empty script fails.
#[derive(Default)]
pub struct ScriptedSuggestions {
    suggestions: Vec<String>,
    choices: Vec<String>,
}

impl ScriptedSuggestions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_suggestion(mut self, text: impl Into<String>) -> Self {
        self.suggestions.push(text.into());
        self
    }

    pub fn with_choice(mut self, text: impl Into<String>) -> Self {
        self.choices.push(text.into());
        self
    }
}

#[async_trait]
impl SuggestionGenerator for ScriptedSuggestions {
    async fn suggestions(&self, _narrative: &str, _recent_text: &str) -> Result<Vec<Suggestion>, PostGenError> {
        if self.suggestions.is_empty() {
            return Err(PostGenError::Parse("no scripted suggestions".to_string()));
        }
        Ok(self
            .suggestions
            .iter()
            .map(|text| Suggestion {
                text: text.clone(),
                kind: "action".to_string(),
            })
            .collect())
    }
}

#[async_trait]
impl ActionChoiceGenerator for ScriptedSuggestions {
    async fn action_choices(&self, _narrative: &str, _recent_text: &str) -> Result<Vec<ActionChoice>, PostGenError> {
        if self.choices.is_empty() {
            return Err(PostGenError::Parse("no scripted choices".to_string()));
        }
        Ok(self
            .choices
            .iter()
            .map(|text| ActionChoice { text: text.clone() })
            .collect())
    }
}

// ============================================================================
// Store and UI
// ============================================================================

#[derive(Debug, Clone, Default)]
struct StoryData {
    entries: Vec<StoryEntry>,
    world: WorldState,
    time: TimeTracker,
    lore: Vec<LoreEntry>,
    chapters: Vec<Chapter>,
}

/// An in-memory [`StoryStore`]. Unknown stories read as empty.
#[derive(Default)]
pub struct MemoryStore {
    stories: Mutex<HashMap<StoryId, StoryData>>,
    entries_delay: Mutex<Option<Duration>>,
    failing_entity_deletes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_story<T>(&self, story: StoryId, f: impl FnOnce(&mut StoryData) -> T) -> T {
        f(lock(&self.stories).entry(story).or_default())
    }

    pub fn set_entries(&self, story: StoryId, entries: Vec<StoryEntry>) {
        self.with_story(story, |data| data.entries = entries);
    }

    pub fn push_entry(&self, story: StoryId, entry: StoryEntry) {
        self.with_story(story, |data| data.entries.push(entry));
    }

    pub fn set_world(&self, story: StoryId, world: WorldState) {
        self.with_story(story, |data| data.world = world);
    }

    pub fn set_lore(&self, story: StoryId, lore: Vec<LoreEntry>) {
        self.with_story(story, |data| data.lore = lore);
    }

    pub fn set_chapters(&self, story: StoryId, chapters: Vec<Chapter>) {
        self.with_story(story, |data| data.chapters = chapters);
    }

    pub fn entries_of(&self, story: StoryId) -> Vec<StoryEntry> {
        self.with_story(story, |data| data.entries.clone())
    }

    pub fn world_of(&self, story: StoryId) -> WorldState {
        self.with_story(story, |data| data.world.clone())
    }

    pub fn time_of(&self, story: StoryId) -> TimeTracker {
        self.with_story(story, |data| data.time)
    }

    /// Make every `entries` read wait `delay` first. `None` turns it off.
    pub fn set_entries_delay(&self, delay: Option<Duration>) {
        *lock(&self.entries_delay) = delay;
    }

    /// Fail the next `count` calls to `delete_entities_created_after`.
    pub fn fail_entity_deletes(&self, count: usize) {
        self.failing_entity_deletes.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoryStore for MemoryStore {
    async fn entries(&self, story: StoryId) -> Result<Vec<StoryEntry>, StoreError> {
        let delay = *lock(&self.entries_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.entries_of(story))
    }

    async fn add_entry(&self, story: StoryId, entry: StoryEntry) -> Result<(), StoreError> {
        self.push_entry(story, entry);
        Ok(())
    }

    async fn update_entry(&self, story: StoryId, id: EntryId, content: String) -> Result<(), StoreError> {
        self.with_story(story, |data| {
            let entry = data
                .entries
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or(StoreError::EntryNotFound(id))?;
            entry.content = content;
            Ok(())
        })
    }

    async fn delete_entry(&self, story: StoryId, id: EntryId) -> Result<(), StoreError> {
        self.with_story(story, |data| {
            let before = data.entries.len();
            data.entries.retain(|e| e.id != id);
            if data.entries.len() == before {
                return Err(StoreError::EntryNotFound(id));
            }
            Ok(())
        })
    }

    async fn delete_entries_from_position(&self, story: StoryId, position: usize) -> Result<usize, StoreError> {
        Ok(self.with_story(story, |data| {
            let removed = data.entries.len().saturating_sub(position);
            data.entries.truncate(position);
            removed
        }))
    }

    async fn world(&self, story: StoryId) -> Result<WorldState, StoreError> {
        Ok(self.world_of(story))
    }

    async fn replace_world(&self, story: StoryId, world: WorldState) -> Result<(), StoreError> {
        self.set_world(story, world);
        Ok(())
    }

    async fn delete_entities_created_after(&self, story: StoryId, since: i64) -> Result<usize, StoreError> {
        let failing = self
            .failing_entity_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Backend("entity delete failed".to_string()));
        }
        Ok(self.with_story(story, |data| data.world.delete_created_since(since)))
    }

    async fn restore_entity_snapshots(&self, story: StoryId, snapshot: &WorldState) -> Result<usize, StoreError> {
        Ok(self.with_story(story, |data| data.world.restore_snapshot(snapshot)))
    }

    async fn time(&self, story: StoryId) -> Result<TimeTracker, StoreError> {
        Ok(self.time_of(story))
    }

    async fn set_time(&self, story: StoryId, time: TimeTracker) -> Result<(), StoreError> {
        self.with_story(story, |data| data.time = time);
        Ok(())
    }

    async fn lore_entries(&self, story: StoryId) -> Result<Vec<LoreEntry>, StoreError> {
        Ok(self.with_story(story, |data| data.lore.clone()))
    }

    async fn chapters(&self, story: StoryId) -> Result<Vec<Chapter>, StoreError> {
        Ok(self.with_story(story, |data| data.chapters.clone()))
    }
}

/// A [`UiOps`] that remembers what was asked of it.
#[derive(Default)]
pub struct RecordingUi {
    active: Mutex<Option<StoryId>>,
    generating: AtomicBool,
    aborts: AtomicUsize,
    clears: AtomicUsize,
}

impl RecordingUi {
    pub fn new(active: Option<StoryId>) -> Self {
        Self {
            active: Mutex::new(active),
            ..Default::default()
        }
    }

    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl UiOps for RecordingUi {
    fn active_story(&self) -> Option<StoryId> {
        *lock(&self.active)
    }

    fn set_active_story(&self, story: StoryId) {
        *lock(&self.active) = Some(story);
    }

    fn abort_generation(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }

    fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    fn set_generating(&self, generating: bool) {
        self.generating.store(generating, Ordering::SeqCst);
    }

    fn clear_transient(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}

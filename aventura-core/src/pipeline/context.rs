//! Pipeline inputs: the turn's story context, the collaborators, and prompt assembly.

use super::config::{PipelineConfig, StoryMode};
use crate::agentic::ChapterQuery;
use crate::classifier::Classifier;
use crate::provider::Provider;
use crate::retrieval::{ActivationTracker, LoreSelector, RetrievalResult, TimelineFill};
use crate::story::{
    BeatStatus, Chapter, EntryId, EntryType, LoreEntry, StoryEntry, StoryId, TimeTracker,
    WorldState,
};
use crate::suggestions::{ActionChoiceGenerator, SuggestionGenerator};
use crate::translation::Translator;
use claude::{Message, Request};
use std::sync::Arc;
use tokio::sync::Mutex;

const NARRATOR_ADVENTURE: &str = include_str!("../prompts/narrator_adventure.txt");
const NARRATOR_CREATIVE: &str = include_str!("../prompts/narrator_creative.txt");

/// The action that starts a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct UserActionInput {
    /// Id of the user-action entry this turn will persist.
    pub entry_id: EntryId,
    pub content: String,
}

impl UserActionInput {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            entry_id: EntryId::new(),
            content: content.into(),
        }
    }

    /// Reuse an existing entry id, for retries.
    pub fn with_entry_id(mut self, entry_id: EntryId) -> Self {
        self.entry_id = entry_id;
        self
    }
}

/// Snapshot of the story a turn is generated against.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub story_id: StoryId,
    pub user_action: UserActionInput,
    /// Entries before this turn.
    pub entries: Vec<StoryEntry>,
    pub lore: Vec<LoreEntry>,
    pub chapters: Vec<Chapter>,
    pub world: WorldState,
    pub time: TimeTracker,
}

impl GenerationContext {
    pub fn new(story_id: StoryId, user_action: UserActionInput) -> Self {
        Self {
            story_id,
            user_action,
            entries: Vec::new(),
            lore: Vec::new(),
            chapters: Vec::new(),
            world: WorldState::default(),
            time: TimeTracker::default(),
        }
    }

    pub fn with_entries(mut self, entries: Vec<StoryEntry>) -> Self {
        self.entries = entries;
        self
    }

    pub fn with_lore(mut self, lore: Vec<LoreEntry>) -> Self {
        self.lore = lore;
        self
    }

    pub fn with_chapters(mut self, chapters: Vec<Chapter>) -> Self {
        self.chapters = chapters;
        self
    }

    pub fn with_world(mut self, world: WorldState) -> Self {
        self.world = world;
        self
    }

    pub fn with_time(mut self, time: TimeTracker) -> Self {
        self.time = time;
        self
    }

    /// Current story length, where this turn's entries will start.
    pub fn story_position(&self) -> usize {
        self.entries.len()
    }
}

/// The pipeline's collaborators. Only the provider, classifier and activation
/// tracker are required; every optional helper that is missing simply skips its step.
#[derive(Clone)]
pub struct PipelineDependencies {
    pub provider: Arc<dyn Provider>,
    pub classifier: Arc<dyn Classifier>,
    /// The story's tracker, shared with the rollback manager.
    pub activation: Arc<Mutex<ActivationTracker>>,
    pub lore_selector: Option<Arc<dyn LoreSelector>>,
    pub timeline: Option<Arc<dyn TimelineFill>>,
    pub chapter_query: Option<Arc<dyn ChapterQuery>>,
    pub translator: Option<Arc<dyn Translator>>,
    pub suggestions: Option<Arc<dyn SuggestionGenerator>>,
    pub action_choices: Option<Arc<dyn ActionChoiceGenerator>>,
}

impl PipelineDependencies {
    pub fn new(
        provider: Arc<dyn Provider>,
        classifier: Arc<dyn Classifier>,
        activation: Arc<Mutex<ActivationTracker>>,
    ) -> Self {
        Self {
            provider,
            classifier,
            activation,
            lore_selector: None,
            timeline: None,
            chapter_query: None,
            translator: None,
            suggestions: None,
            action_choices: None,
        }
    }

    pub fn with_lore_selector(mut self, selector: Arc<dyn LoreSelector>) -> Self {
        self.lore_selector = Some(selector);
        self
    }

    pub fn with_timeline(mut self, timeline: Arc<dyn TimelineFill>) -> Self {
        self.timeline = Some(timeline);
        self
    }

    pub fn with_chapter_query(mut self, queries: Arc<dyn ChapterQuery>) -> Self {
        self.chapter_query = Some(queries);
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn Translator>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_suggestions(mut self, suggestions: Arc<dyn SuggestionGenerator>) -> Self {
        self.suggestions = Some(suggestions);
        self
    }

    pub fn with_action_choices(mut self, action_choices: Arc<dyn ActionChoiceGenerator>) -> Self {
        self.action_choices = Some(action_choices);
        self
    }
}

/// Extra context gathered before the narrative call.
#[derive(Debug, Default)]
pub(crate) struct PromptContext<'a> {
    pub lore: Option<&'a RetrievalResult>,
    pub history: Option<&'a str>,
}

fn world_summary(world: &WorldState, time: &TimeTracker) -> String {
    let mut lines = vec![format!("Time: {time}")];

    if let Some(location) = &world.scene.current_location {
        let description = world
            .location(location)
            .map(|l| l.description.as_str())
            .filter(|d| !d.is_empty());
        match description {
            Some(description) => lines.push(format!("Location: {location} - {description}")),
            None => lines.push(format!("Location: {location}")),
        }
    }

    if !world.scene.present_characters.is_empty() {
        lines.push(format!("Present: {}", world.scene.present_characters.join(", ")));
    }

    let inventory: Vec<&str> = world.inventory().collect();
    if !inventory.is_empty() {
        lines.push(format!("Inventory: {}", inventory.join(", ")));
    }

    let open_beats: Vec<&str> = world
        .story_beats
        .iter()
        .filter(|b| matches!(b.status, BeatStatus::Pending | BeatStatus::Active))
        .map(|b| b.title.as_str())
        .collect();
    if !open_beats.is_empty() {
        lines.push(format!("Open threads: {}", open_beats.join(", ")));
    }

    lines.join("\n")
}

/// Assemble the narrator system prompt.
pub(crate) fn build_system_prompt(
    config: &PipelineConfig,
    ctx: &GenerationContext,
    extra: &PromptContext<'_>,
) -> String {
    let base = match (&config.narrative.custom_system_prompt, config.mode) {
        (Some(custom), _) => custom.as_str(),
        (None, StoryMode::Adventure) => NARRATOR_ADVENTURE,
        (None, StoryMode::CreativeWriting) => NARRATOR_CREATIVE,
    };

    let mut prompt = base.trim_end().to_string();
    prompt.push_str("\n\n## Current state\n");
    prompt.push_str(&world_summary(&ctx.world, &ctx.time));

    if let Some(lore) = extra.lore.filter(|l| !l.is_empty()) {
        prompt.push_str("\n\n## Lore\n");
        prompt.push_str(&lore.render());
    }

    if let Some(history) = extra.history.filter(|h| !h.trim().is_empty()) {
        prompt.push_str("\n\n## Earlier in the story\n");
        prompt.push_str(history.trim());
    }

    prompt
}

/// Replay recent entries as conversation turns, ending with the user's action.
pub(crate) fn build_messages(ctx: &GenerationContext, window: usize) -> Vec<Message> {
    let start = ctx.entries.len().saturating_sub(window);
    let mut messages: Vec<Message> = ctx.entries[start..]
        .iter()
        .filter_map(|entry| match entry.entry_type {
            EntryType::UserAction => Some(Message::user(&entry.content)),
            EntryType::Narration => Some(Message::assistant(&entry.content)),
            EntryType::System => None,
        })
        .collect();

    // The API expects the conversation to open with a user turn.
    if messages.first().is_some_and(|m| m.role != claude::Role::User) {
        messages.insert(0, Message::user("(The story so far.)"));
    }

    messages.push(Message::user(&ctx.user_action.content));
    messages
}

pub(crate) fn narrative_request(
    config: &PipelineConfig,
    ctx: &GenerationContext,
    extra: &PromptContext<'_>,
) -> Request {
    let narrative = &config.narrative;
    let mut request = Request::new(build_messages(ctx, narrative.recent_entry_window))
        .with_system(build_system_prompt(config, ctx, extra))
        .with_model_opt(narrative.model.as_deref())
        .with_max_tokens(narrative.max_tokens);
    if let Some(temperature) = narrative.temperature {
        request = request.with_temperature(temperature);
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::story::LoreType;

    fn ctx() -> GenerationContext {
        let mut world = WorldState::new();
        world.add_location("Harbor", "Salt and tar", 0);
        world.scene.current_location = Some("Harbor".to_string());
        world.add_item("Lantern", "Brass", true, 0);

        GenerationContext::new(StoryId::new(), UserActionInput::new("I light the lantern"))
            .with_entries(vec![
                StoryEntry::narration("Night falls over the harbor."),
                StoryEntry::user_action("I look around"),
                StoryEntry::system("Generation failed: timeout"),
                StoryEntry::narration("Fog rolls in."),
            ])
            .with_world(world)
    }

    #[test]
    fn test_messages_alternate_and_end_with_action() {
        let messages = build_messages(&ctx(), 10);
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                claude::Role::User,
                claude::Role::Assistant,
                claude::Role::User,
                claude::Role::Assistant,
                claude::Role::User
            ]
        );
        assert_eq!(messages.last().unwrap().text(), "I light the lantern");
    }

    #[test]
    fn test_system_prompt_sections() {
        let lore = RetrievalResult {
            all: vec![LoreEntry::new(LoreType::Location, "Harbor", "Smugglers' haven")],
            ..Default::default()
        };
        let extra = PromptContext {
            lore: Some(&lore),
            history: Some("Chapter 1: The heist went wrong."),
        };
        let prompt = build_system_prompt(&PipelineConfig::default(), &ctx(), &extra);

        assert!(prompt.contains("Location: Harbor - Salt and tar"));
        assert!(prompt.contains("Inventory: Lantern"));
        assert!(prompt.contains("[location] Harbor: Smugglers' haven"));
        assert!(prompt.contains("## Earlier in the story\nChapter 1"));
    }

    #[test]
    fn test_custom_prompt_replaces_narrator() {
        let config = PipelineConfig::default().with_system_prompt("You are terse.");
        let prompt = build_system_prompt(&config, &ctx(), &PromptContext::default());
        assert!(prompt.starts_with("You are terse."));
    }
}

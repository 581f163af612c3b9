//! Pipeline configuration.

use crate::agentic::AgenticConfig;
use crate::retrieval::RetrievalConfig;
use serde::{Deserialize, Serialize};

/// Which kind of story is being told.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryMode {
    /// Second-person interactive fiction; post-generation offers action choices.
    #[default]
    Adventure,
    /// Co-writing prose; post-generation offers story-direction suggestions.
    CreativeWriting,
}

/// How deep history is pulled into the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    Off,
    /// A single planning call asks up to three chapter questions.
    #[default]
    TimelineFill,
    /// The tool-calling sub-agent, once the story has enough chapters.
    Agentic,
}

/// Settings for the narrative call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrativeConfig {
    pub model: Option<String>,
    pub max_tokens: usize,
    pub temperature: Option<f32>,
    /// Story entries replayed as conversation history.
    pub recent_entry_window: usize,
    /// Replaces the built-in narrator prompt.
    pub custom_system_prompt: Option<String>,
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 2048,
            temperature: Some(0.8),
            recent_entry_window: 10,
            custom_system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub mode: MemoryMode,
    /// Below this many chapters, `Agentic` falls back to timeline fill.
    pub agentic_min_chapters: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            mode: MemoryMode::default(),
            agentic_min_chapters: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub enabled: bool,
    pub target_language: String,
    pub translate_narrative: bool,
    /// Translate names and descriptions of newly created world entities.
    pub translate_world: bool,
    /// Translate suggestions and action choices.
    pub translate_post: bool,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_language: "English".to_string(),
            translate_narrative: true,
            translate_world: true,
            translate_post: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostGenerationConfig {
    pub suggestions: bool,
    pub action_choices: bool,
    /// Story entries shown to the post-generation helpers.
    pub recent_window: usize,
}

impl Default for PostGenerationConfig {
    fn default() -> Self {
        Self {
            suggestions: true,
            action_choices: true,
            recent_window: 6,
        }
    }
}

/// Everything the pipeline needs to know besides its collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: StoryMode,
    pub narrative: NarrativeConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
    pub agentic: AgenticConfig,
    pub translation: TranslationConfig,
    pub post: PostGenerationConfig,
    /// Capacity of the event channel between producer and consumer.
    pub event_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: StoryMode::default(),
            narrative: NarrativeConfig::default(),
            retrieval: RetrievalConfig::default(),
            memory: MemoryConfig::default(),
            agentic: AgenticConfig::default(),
            translation: TranslationConfig::default(),
            post: PostGenerationConfig::default(),
            event_buffer: 64,
        }
    }
}

impl PipelineConfig {
    pub fn with_mode(mut self, mode: StoryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_memory_mode(mut self, mode: MemoryMode) -> Self {
        self.memory.mode = mode;
        self
    }

    pub fn with_retrieval(mut self, retrieval: RetrievalConfig) -> Self {
        self.retrieval = retrieval;
        self
    }

    pub fn with_agentic(mut self, agentic: AgenticConfig) -> Self {
        self.agentic = agentic;
        self
    }

    /// Enable translation into `language`.
    pub fn with_translation(mut self, language: impl Into<String>) -> Self {
        self.translation.enabled = true;
        self.translation.target_language = language.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.narrative.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.narrative.custom_system_prompt = Some(prompt.into());
        self
    }

    pub fn with_event_buffer(mut self, event_buffer: usize) -> Self {
        self.event_buffer = event_buffer;
        self
    }
}

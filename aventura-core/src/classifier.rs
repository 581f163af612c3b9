//! Classification: turning fresh narration into proposed world-state deltas.

use crate::json::parse_json;
use crate::provider::{complete_text, Provider};
use crate::story::{BeatStatus, CharacterStatus, TimeProgression, WorldState};
use async_trait::async_trait;
use claude::{Message, Request};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

const CLASSIFIER_PROMPT: &str = include_str!("prompts/classifier.txt");

/// Errors from classification. A failed classification fails the turn.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Provider error: {0}")]
    Provider(#[from] claude::Error),

    #[error("Failed to parse classification: {0}")]
    Parse(String),

    #[error("Classification failed: {0}")]
    Failed(String),
}

// ============================================================================
// Result types
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewCharacter {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewLocation {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewItem {
    pub name: String,
    pub description: String,
    pub in_inventory: bool,
    pub quantity: u32,
}

impl Default for NewItem {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: String::new(),
            in_inventory: false,
            quantity: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewStoryBeat {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterUpdate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CharacterStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationUpdate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visited: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemUpdate {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_inventory: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equipped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryBeatUpdate {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BeatStatus>,
}

/// Scene metadata extracted from the narration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneUpdate {
    pub present_characters: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_location: Option<String>,
    pub time_progression: TimeProgression,
}

/// Proposed world-state delta for one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationResult {
    pub new_characters: Vec<NewCharacter>,
    pub new_locations: Vec<NewLocation>,
    pub new_items: Vec<NewItem>,
    pub new_story_beats: Vec<NewStoryBeat>,
    pub character_updates: Vec<CharacterUpdate>,
    pub location_updates: Vec<LocationUpdate>,
    pub item_updates: Vec<ItemUpdate>,
    pub story_beat_updates: Vec<StoryBeatUpdate>,
    pub scene: SceneUpdate,
}

impl ClassificationResult {
    /// Count of proposed new entities.
    pub fn new_entity_count(&self) -> usize {
        self.new_characters.len()
            + self.new_locations.len()
            + self.new_items.len()
            + self.new_story_beats.len()
    }
}

// ============================================================================
// Classifier
// ============================================================================

/// Extracts world-state deltas from narration.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        narrative: &str,
        user_action: &str,
        world: &WorldState,
    ) -> Result<ClassificationResult, ClassifierError>;
}

/// A [`Classifier`] backed by a model asked for JSON.
pub struct ModelClassifier {
    provider: Arc<dyn Provider>,
    model: Option<String>,
    max_tokens: usize,
}

impl ModelClassifier {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            model: None,
            max_tokens: 1500,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

fn known_entities(world: &WorldState) -> String {
    let join = |names: Vec<&str>| {
        if names.is_empty() {
            "(none)".to_string()
        } else {
            names.join(", ")
        }
    };

    format!(
        "Characters: {}\nLocations: {}\nItems: {}\nStory beats: {}\nCurrent location: {}",
        join(world.characters.iter().map(|c| c.name.as_str()).collect()),
        join(world.locations.iter().map(|l| l.name.as_str()).collect()),
        join(world.items.iter().map(|i| i.name.as_str()).collect()),
        join(world.story_beats.iter().map(|b| b.title.as_str()).collect()),
        world.scene.current_location.as_deref().unwrap_or("(unknown)"),
    )
}

#[async_trait]
impl Classifier for ModelClassifier {
    async fn classify(
        &self,
        narrative: &str,
        user_action: &str,
        world: &WorldState,
    ) -> Result<ClassificationResult, ClassifierError> {
        let prompt = format!(
            "## Known world\n{}\n\n## Player action\n{user_action}\n\n## Narration\n{narrative}",
            known_entities(world)
        );
        let request = Request::new(vec![Message::user(prompt)])
            .with_system(CLASSIFIER_PROMPT)
            .with_model_opt(self.model.as_deref())
            .with_max_tokens(self.max_tokens)
            .with_temperature(0.0);

        let text = complete_text(self.provider.as_ref(), request).await?;
        parse_json(&text).map_err(|e| ClassifierError::Parse(e.to_string()))
    }
}

//! The pre-turn snapshot a stop or retry restores from.

use crate::retrieval::ActivationState;
use crate::story::{EntryId, StoryEntry, StoryId, TimeTracker, WorldState};
use serde::{Deserialize, Serialize};

/// How the user phrased an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    #[default]
    Do,
    Say,
    Think,
    Story,
    Free,
}

/// Everything needed to undo one turn, captured before it starts.
///
/// A story has at most one backup; each turn overwrites the previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryBackup {
    pub story_id: StoryId,
    /// Number of entries before the turn. Entries at or after it belong to the turn.
    pub story_position: usize,
    pub entries: Vec<StoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_snapshot: Option<WorldState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activation_state: Option<ActivationState>,
    pub time_tracker: TimeTracker,
    pub raw_input: String,
    pub action_type: ActionType,
    pub was_raw_action_choice: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_action_entry_id: Option<EntryId>,
    /// Milliseconds since the Unix epoch. World entities created at or after this belong to the turn.
    pub created_at: i64,
    /// Whether world and activation snapshots were captured.
    pub has_full_state: bool,
}

impl RetryBackup {
    pub fn new(story_id: StoryId, entries: Vec<StoryEntry>, time_tracker: TimeTracker) -> Self {
        Self {
            story_id,
            story_position: entries.len(),
            entries,
            world_snapshot: None,
            activation_state: None,
            time_tracker,
            raw_input: String::new(),
            action_type: ActionType::default(),
            was_raw_action_choice: false,
            user_action_entry_id: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            has_full_state: false,
        }
    }

    /// Attach world and activation snapshots.
    pub fn with_full_state(mut self, world: WorldState, activation: ActivationState) -> Self {
        self.world_snapshot = Some(world);
        self.activation_state = Some(activation);
        self.has_full_state = true;
        self
    }

    pub fn with_input(mut self, raw_input: impl Into<String>, action_type: ActionType) -> Self {
        self.raw_input = raw_input.into();
        self.action_type = action_type;
        self
    }

    pub fn with_raw_action_choice(mut self, was_raw_action_choice: bool) -> Self {
        self.was_raw_action_choice = was_raw_action_choice;
        self
    }

    pub fn with_user_action_entry(mut self, id: EntryId) -> Self {
        self.user_action_entry_id = Some(id);
        self
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    /// A backup only applies while its story is the active one.
    pub fn is_valid_for(&self, active: Option<StoryId>) -> bool {
        active == Some(self.story_id)
    }
}

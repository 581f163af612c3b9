//! Story entries: the narrative units a story is made of.

use super::ids::{BranchId, EntryId};
use serde::{Deserialize, Serialize};

/// Kind of story entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Something the user wrote.
    UserAction,
    /// Model-generated narration.
    Narration,
    /// A note from the application itself (for example a failed generation).
    System,
}

impl EntryType {
    /// Get the display name for this entry type.
    pub fn name(&self) -> &'static str {
        match self {
            EntryType::UserAction => "User",
            EntryType::Narration => "Narrator",
            EntryType::System => "System",
        }
    }
}

/// A narrative unit of a story.
///
/// Entries are appended by the caller of the generation pipeline and are removed
/// wholesale when a turn is rolled back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryEntry {
    pub id: EntryId,
    pub entry_type: EntryType,
    pub content: String,
    /// Model reasoning that accompanied a narration, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<BranchId>,
}

impl StoryEntry {
    /// Create an entry stamped with the current time.
    pub fn new(entry_type: EntryType, content: impl Into<String>) -> Self {
        Self {
            id: EntryId::new(),
            entry_type,
            content: content.into(),
            reasoning: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            branch_id: None,
        }
    }

    pub fn user_action(content: impl Into<String>) -> Self {
        Self::new(EntryType::UserAction, content)
    }

    pub fn narration(content: impl Into<String>) -> Self {
        Self::new(EntryType::Narration, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(EntryType::System, content)
    }

    /// Attach model reasoning (ignored when blank).
    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        let reasoning = reasoning.into();
        if !reasoning.trim().is_empty() {
            self.reasoning = Some(reasoning);
        }
        self
    }

    pub fn with_branch(mut self, branch_id: BranchId) -> Self {
        self.branch_id = Some(branch_id);
        self
    }

    /// Use a specific ID (a retried turn keeps its user-action ID).
    pub fn with_id(mut self, id: EntryId) -> Self {
        self.id = id;
        self
    }
}

/// Join the last `window` entries into a plain transcript.
pub fn transcript(entries: &[StoryEntry], window: usize) -> String {
    let start = entries.len().saturating_sub(window);
    entries[start..]
        .iter()
        .filter(|e| e.entry_type != EntryType::System)
        .map(|e| format!("[{}] {}", e.entry_type.name(), e.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_reasoning_is_dropped() {
        let entry = StoryEntry::narration("The door creaks").with_reasoning("   ");
        assert!(entry.reasoning.is_none());
    }

    #[test]
    fn test_transcript_uses_window_and_skips_system() {
        let entries = vec![
            StoryEntry::user_action("one"),
            StoryEntry::narration("two"),
            StoryEntry::system("Generation failed: boom"),
            StoryEntry::user_action("three"),
        ];

        let text = transcript(&entries, 3);
        assert!(!text.contains("one"));
        assert!(text.contains("[Narrator] two"));
        assert!(!text.contains("boom"));
        assert!(text.ends_with("[User] three"));
    }

    #[test]
    fn test_entry_type_serializes_snake_case() {
        let json = serde_json::to_string(&EntryType::UserAction).unwrap();
        assert_eq!(json, "\"user_action\"");
    }
}

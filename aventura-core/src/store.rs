//! Collaborator boundaries: story persistence and UI state.

use crate::story::{Chapter, EntryId, LoreEntry, StoryEntry, StoryId, TimeTracker, WorldState};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Story not found: {0}")]
    StoryNotFound(StoryId),

    #[error("Entry not found: {0}")]
    EntryNotFound(EntryId),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Persistence for a story's entries, world state, clock, lore and chapters.
///
/// Implementations own durability; the core only calls these primitives, and
/// rollback composes them into an exact restore.
#[async_trait]
pub trait StoryStore: Send + Sync {
    /// Entries in story order.
    async fn entries(&self, story: StoryId) -> Result<Vec<StoryEntry>, StoreError>;

    async fn add_entry(&self, story: StoryId, entry: StoryEntry) -> Result<(), StoreError>;

    /// Replace an entry's content (translation updates).
    async fn update_entry(&self, story: StoryId, id: EntryId, content: String) -> Result<(), StoreError>;

    async fn delete_entry(&self, story: StoryId, id: EntryId) -> Result<(), StoreError>;

    /// Delete every entry at index `position` or later. Returns how many were removed.
    async fn delete_entries_from_position(&self, story: StoryId, position: usize) -> Result<usize, StoreError>;

    async fn world(&self, story: StoryId) -> Result<WorldState, StoreError>;

    async fn replace_world(&self, story: StoryId, world: WorldState) -> Result<(), StoreError>;

    /// Delete world entities with `created_at >= since`. Returns how many were removed.
    async fn delete_entities_created_after(&self, story: StoryId, since: i64) -> Result<usize, StoreError>;

    /// Put entities (and the scene) back to the snapshot's field values.
    async fn restore_entity_snapshots(&self, story: StoryId, snapshot: &WorldState) -> Result<usize, StoreError>;

    async fn time(&self, story: StoryId) -> Result<TimeTracker, StoreError>;

    async fn set_time(&self, story: StoryId, time: TimeTracker) -> Result<(), StoreError>;

    async fn lore_entries(&self, story: StoryId) -> Result<Vec<LoreEntry>, StoreError>;

    async fn chapters(&self, story: StoryId) -> Result<Vec<Chapter>, StoreError>;
}

/// The slice of UI state a turn touches.
pub trait UiOps: Send + Sync {
    fn active_story(&self) -> Option<StoryId>;

    fn set_active_story(&self, story: StoryId);

    /// Cancel the in-flight model call, if any.
    fn abort_generation(&self);

    fn is_generating(&self) -> bool;

    fn set_generating(&self, generating: bool);

    /// Drop suggestions, action choices and error banners from the last turn.
    fn clear_transient(&self);
}

//! Story data: entries, lorebook, chapters, world state and the in-story clock.

mod chapter;
mod entry;
mod ids;
mod lore;
mod time;
mod world;

pub use chapter::{chapter_listing, clamp_range, Chapter};
pub use entry::{transcript, EntryType, StoryEntry};
pub use ids::{BranchId, EntryId, LoreId, StoryId, WorldEntityId};
pub use lore::{contains_word, count_term_matches, InjectionMode, LoreEntry, LoreType};
pub use time::{TimeProgression, TimeTracker};
pub use world::{
    BeatStatus, Character, CharacterStatus, EntityKind, Item, Location, Scene, StoryBeat,
    WorldChanges, WorldEntity, WorldState,
};

/// Rough token estimate used for prompt budgeting: a quarter of the character count,
/// rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}

//! Live world state: characters, locations, items and story beats.
//!
//! The generation pipeline only reads this and proposes deltas as a
//! [`ClassificationResult`]. The story layer applies them with
//! [`WorldState::apply_classification`] and rolls them back with
//! [`WorldState::delete_created_since`] and [`WorldState::restore_snapshot`].

use super::ids::WorldEntityId;
use crate::classifier::ClassificationResult;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// Entities
// ============================================================================

/// Whether a character is around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterStatus {
    #[default]
    Active,
    Inactive,
    Dead,
    #[serde(other)]
    Unknown,
}

/// Progress of a story beat (a quest, goal or plot thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeatStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Failed,
}

/// The four kinds of world entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Character,
    Location,
    Item,
    StoryBeat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: WorldEntityId,
    pub name: String,
    pub description: String,
    /// How the character feels about the protagonist ("friendly", "wary", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disposition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    #[serde(default)]
    pub status: CharacterStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: WorldEntityId,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub visited: bool,
    #[serde(default)]
    pub current: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: WorldEntityId,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub in_inventory: bool,
    #[serde(default)]
    pub equipped: bool,
    pub quantity: u32,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryBeat {
    pub id: WorldEntityId,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub status: BeatStatus,
    pub created_at: i64,
}

/// Who is on stage and where.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default)]
    pub present_characters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<String>,
}

/// Common access to world entities.
pub trait WorldEntity {
    fn id(&self) -> WorldEntityId;
    fn name(&self) -> &str;
    fn created_at(&self) -> i64;
}

macro_rules! impl_world_entity {
    ($ty:ty, $name:ident) => {
        impl WorldEntity for $ty {
            fn id(&self) -> WorldEntityId {
                self.id
            }

            fn name(&self) -> &str {
                &self.$name
            }

            fn created_at(&self) -> i64 {
                self.created_at
            }
        }
    };
}

impl_world_entity!(Character, name);
impl_world_entity!(Location, name);
impl_world_entity!(Item, name);
impl_world_entity!(StoryBeat, title);

fn find_by_name<'a, T: WorldEntity>(entities: &'a [T], name: &str) -> Option<&'a T> {
    let name = name.trim();
    entities.iter().find(|e| e.name().eq_ignore_ascii_case(name))
}

fn find_by_name_mut<'a, T: WorldEntity>(entities: &'a mut [T], name: &str) -> Option<&'a mut T> {
    let name = name.trim();
    entities.iter_mut().find(|e| e.name().eq_ignore_ascii_case(name))
}

/// Replace entities by id with their snapshot, appending any that are missing.
fn upsert_all<T: WorldEntity + Clone>(entities: &mut Vec<T>, snapshots: &[T]) -> usize {
    for snapshot in snapshots {
        match entities.iter_mut().find(|e| e.id() == snapshot.id()) {
            Some(existing) => *existing = snapshot.clone(),
            None => entities.push(snapshot.clone()),
        }
    }
    snapshots.len()
}

fn remove_created_since<T: WorldEntity>(entities: &mut Vec<T>, since: i64) -> usize {
    let before = entities.len();
    entities.retain(|e| e.created_at() < since);
    before - entities.len()
}

// ============================================================================
// World state
// ============================================================================

/// What applying a classification changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorldChanges {
    pub created: Vec<(EntityKind, WorldEntityId)>,
    pub updated: Vec<(EntityKind, WorldEntityId)>,
    pub location_changed: bool,
}

impl WorldChanges {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && !self.location_changed
    }
}

/// The story's tracked world.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldState {
    #[serde(default)]
    pub characters: Vec<Character>,
    #[serde(default)]
    pub locations: Vec<Location>,
    #[serde(default)]
    pub items: Vec<Item>,
    #[serde(default)]
    pub story_beats: Vec<StoryBeat>,
    #[serde(default)]
    pub scene: Scene,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_character(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        now: i64,
    ) -> WorldEntityId {
        let id = WorldEntityId::new();
        self.characters.push(Character {
            id,
            name: name.into(),
            description: description.into(),
            disposition: None,
            relationship: None,
            status: CharacterStatus::Active,
            created_at: now,
        });
        id
    }

    pub fn add_location(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        now: i64,
    ) -> WorldEntityId {
        let id = WorldEntityId::new();
        self.locations.push(Location {
            id,
            name: name.into(),
            description: description.into(),
            visited: false,
            current: false,
            created_at: now,
        });
        id
    }

    pub fn add_item(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        in_inventory: bool,
        now: i64,
    ) -> WorldEntityId {
        let id = WorldEntityId::new();
        self.items.push(Item {
            id,
            name: name.into(),
            description: description.into(),
            in_inventory,
            equipped: false,
            quantity: 1,
            created_at: now,
        });
        id
    }

    pub fn add_story_beat(
        &mut self,
        title: impl Into<String>,
        description: impl Into<String>,
        now: i64,
    ) -> WorldEntityId {
        let id = WorldEntityId::new();
        self.story_beats.push(StoryBeat {
            id,
            title: title.into(),
            description: description.into(),
            status: BeatStatus::Pending,
            created_at: now,
        });
        id
    }

    pub fn character(&self, name: &str) -> Option<&Character> {
        find_by_name(&self.characters, name)
    }

    pub fn location(&self, name: &str) -> Option<&Location> {
        find_by_name(&self.locations, name)
    }

    pub fn item(&self, name: &str) -> Option<&Item> {
        find_by_name(&self.items, name)
    }

    pub fn story_beat(&self, title: &str) -> Option<&StoryBeat> {
        find_by_name(&self.story_beats, title)
    }

    /// Names of items the protagonist carries.
    pub fn inventory(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .filter(|i| i.in_inventory)
            .map(|i| i.name.as_str())
    }

    pub fn entity_count(&self) -> usize {
        self.characters.len() + self.locations.len() + self.items.len() + self.story_beats.len()
    }

    /// Apply a classifier's proposed delta.
    ///
    /// Entities are matched by case-insensitive name. Proposed new entities that
    /// already exist are treated as updates of the description. Updates naming an
    /// unknown entity are ignored.
    pub fn apply_classification(&mut self, result: &ClassificationResult, now: i64) -> WorldChanges {
        let mut changes = WorldChanges::default();

        for new in &result.new_characters {
            match find_by_name_mut(&mut self.characters, &new.name) {
                Some(existing) => {
                    if !new.description.trim().is_empty() {
                        existing.description = new.description.clone();
                    }
                    changes.updated.push((EntityKind::Character, existing.id));
                }
                None => {
                    let id = self.add_character(new.name.trim(), &new.description, now);
                    if let Some(character) = self.characters.last_mut() {
                        character.disposition = new.disposition.clone();
                        character.relationship = new.relationship.clone();
                    }
                    changes.created.push((EntityKind::Character, id));
                }
            }
        }

        for new in &result.new_locations {
            match find_by_name_mut(&mut self.locations, &new.name) {
                Some(existing) => {
                    if !new.description.trim().is_empty() {
                        existing.description = new.description.clone();
                    }
                    changes.updated.push((EntityKind::Location, existing.id));
                }
                None => {
                    let id = self.add_location(new.name.trim(), &new.description, now);
                    changes.created.push((EntityKind::Location, id));
                }
            }
        }

        for new in &result.new_items {
            match find_by_name_mut(&mut self.items, &new.name) {
                Some(existing) => {
                    if !new.description.trim().is_empty() {
                        existing.description = new.description.clone();
                    }
                    changes.updated.push((EntityKind::Item, existing.id));
                }
                None => {
                    let id = self.add_item(new.name.trim(), &new.description, new.in_inventory, now);
                    if let Some(item) = self.items.last_mut() {
                        item.quantity = new.quantity.max(1);
                    }
                    changes.created.push((EntityKind::Item, id));
                }
            }
        }

        for new in &result.new_story_beats {
            if find_by_name(&self.story_beats, &new.title).is_none() {
                let id = self.add_story_beat(new.title.trim(), &new.description, now);
                changes.created.push((EntityKind::StoryBeat, id));
            }
        }

        for update in &result.character_updates {
            let Some(character) = find_by_name_mut(&mut self.characters, &update.name) else {
                debug!(name = %update.name, "Ignoring update for unknown character");
                continue;
            };
            if let Some(disposition) = &update.disposition {
                character.disposition = Some(disposition.clone());
            }
            if let Some(relationship) = &update.relationship {
                character.relationship = Some(relationship.clone());
            }
            if let Some(status) = update.status {
                character.status = status;
            }
            if let Some(description) = &update.description {
                character.description = description.clone();
            }
            changes.updated.push((EntityKind::Character, character.id));
        }

        for update in &result.location_updates {
            let Some(location) = find_by_name_mut(&mut self.locations, &update.name) else {
                debug!(name = %update.name, "Ignoring update for unknown location");
                continue;
            };
            if let Some(visited) = update.visited {
                location.visited = visited;
            }
            if let Some(description) = &update.description {
                location.description = description.clone();
            }
            changes.updated.push((EntityKind::Location, location.id));
        }

        for update in &result.item_updates {
            let Some(item) = find_by_name_mut(&mut self.items, &update.name) else {
                debug!(name = %update.name, "Ignoring update for unknown item");
                continue;
            };
            if let Some(in_inventory) = update.in_inventory {
                item.in_inventory = in_inventory;
                if !in_inventory {
                    item.equipped = false;
                }
            }
            if let Some(equipped) = update.equipped {
                item.equipped = equipped && item.in_inventory;
            }
            if let Some(quantity) = update.quantity {
                item.quantity = quantity;
            }
            changes.updated.push((EntityKind::Item, item.id));
        }

        for update in &result.story_beat_updates {
            let Some(beat) = find_by_name_mut(&mut self.story_beats, &update.title) else {
                debug!(title = %update.title, "Ignoring update for unknown story beat");
                continue;
            };
            if let Some(status) = update.status {
                beat.status = status;
            }
            changes.updated.push((EntityKind::StoryBeat, beat.id));
        }

        self.apply_scene(result, now, &mut changes);
        changes
    }

    fn apply_scene(&mut self, result: &ClassificationResult, now: i64, changes: &mut WorldChanges) {
        let scene = &result.scene;

        if !scene.present_characters.is_empty() {
            self.scene.present_characters = scene
                .present_characters
                .iter()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect();
        }

        let Some(location_name) = scene
            .current_location
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
        else {
            return;
        };

        let unchanged = self
            .scene
            .current_location
            .as_deref()
            .is_some_and(|current| current.eq_ignore_ascii_case(location_name));
        if unchanged {
            return;
        }

        if find_by_name(&self.locations, location_name).is_none() {
            let id = self.add_location(location_name, "", now);
            changes.created.push((EntityKind::Location, id));
        }

        for location in &mut self.locations {
            let is_current = location.name.eq_ignore_ascii_case(location_name);
            location.current = is_current;
            if is_current {
                location.visited = true;
                self.scene.current_location = Some(location.name.clone());
            }
        }
        changes.location_changed = true;
    }

    /// Rename and re-describe an entity after translation.
    ///
    /// Returns false when no entity of that kind has `original_name`.
    pub fn apply_translation(
        &mut self,
        kind: EntityKind,
        original_name: &str,
        name: &str,
        description: Option<&str>,
    ) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }

        let renamed = match kind {
            EntityKind::Character => find_by_name_mut(&mut self.characters, original_name).map(|c| {
                c.name = name.to_string();
                if let Some(description) = description {
                    c.description = description.to_string();
                }
            }),
            EntityKind::Location => find_by_name_mut(&mut self.locations, original_name).map(|l| {
                l.name = name.to_string();
                if let Some(description) = description {
                    l.description = description.to_string();
                }
            }),
            EntityKind::Item => find_by_name_mut(&mut self.items, original_name).map(|i| {
                i.name = name.to_string();
                if let Some(description) = description {
                    i.description = description.to_string();
                }
            }),
            EntityKind::StoryBeat => find_by_name_mut(&mut self.story_beats, original_name).map(|b| {
                b.title = name.to_string();
                if let Some(description) = description {
                    b.description = description.to_string();
                }
            }),
        }
        .is_some();

        if renamed && kind != EntityKind::StoryBeat {
            let original = original_name.trim();
            for present in &mut self.scene.present_characters {
                if present.eq_ignore_ascii_case(original) {
                    *present = name.to_string();
                }
            }
            if let Some(current) = &mut self.scene.current_location {
                if current.eq_ignore_ascii_case(original) {
                    *current = name.to_string();
                }
            }
        }
        renamed
    }

    /// Remove every entity created at or after `since`. Returns how many were removed.
    pub fn delete_created_since(&mut self, since: i64) -> usize {
        remove_created_since(&mut self.characters, since)
            + remove_created_since(&mut self.locations, since)
            + remove_created_since(&mut self.items, since)
            + remove_created_since(&mut self.story_beats, since)
    }

    /// Restore entities to their snapshot field values and restore the scene.
    ///
    /// Entities are matched by id; snapshot entities that no longer exist are
    /// re-added. Returns how many entities were restored.
    pub fn restore_snapshot(&mut self, snapshot: &WorldState) -> usize {
        let restored = upsert_all(&mut self.characters, &snapshot.characters)
            + upsert_all(&mut self.locations, &snapshot.locations)
            + upsert_all(&mut self.items, &snapshot.items)
            + upsert_all(&mut self.story_beats, &snapshot.story_beats);
        self.scene = snapshot.scene.clone();
        restored
    }
}

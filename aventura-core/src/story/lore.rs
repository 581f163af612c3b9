//! Lorebook entries: reusable world knowledge that can be injected into prompts.

use super::ids::LoreId;
use serde::{Deserialize, Serialize};

/// What a lorebook entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoreType {
    Character,
    Location,
    Item,
    Faction,
    Concept,
    Event,
}

impl LoreType {
    /// Get the display name for this entry type.
    pub fn name(&self) -> &'static str {
        match self {
            LoreType::Character => "character",
            LoreType::Location => "location",
            LoreType::Item => "item",
            LoreType::Faction => "faction",
            LoreType::Concept => "concept",
            LoreType::Event => "event",
        }
    }

    /// Parse a type name as written by a model or a user (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "character" | "characters" | "npc" => Some(LoreType::Character),
            "location" | "locations" | "place" => Some(LoreType::Location),
            "item" | "items" | "object" => Some(LoreType::Item),
            "faction" | "factions" | "organization" => Some(LoreType::Faction),
            "concept" | "concepts" | "lore" => Some(LoreType::Concept),
            "event" | "events" => Some(LoreType::Event),
            _ => None,
        }
    }
}

/// When an entry is eligible for injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMode {
    /// Always injected (tier 1).
    Always,
    /// Injected when its keywords appear in recent text (tier 2).
    #[default]
    Keyword,
    /// Only injected when a model judges it relevant (tier 3), or when active.
    Relevant,
    /// Never injected automatically.
    Never,
}

/// A lorebook entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoreEntry {
    pub id: LoreId,
    pub name: String,
    pub entry_type: LoreType,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub injection: InjectionMode,
    /// Higher priority wins ties in ranking.
    #[serde(default)]
    pub priority: i32,
    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: i64,
}

impl LoreEntry {
    pub fn new(entry_type: LoreType, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: LoreId::new(),
            name: name.into(),
            entry_type,
            description: description.into(),
            keywords: Vec::new(),
            aliases: Vec::new(),
            injection: InjectionMode::default(),
            priority: 0,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    pub fn with_injection(mut self, injection: InjectionMode) -> Self {
        self.injection = injection;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Name, aliases and keywords, lowercased and deduplicated.
    pub fn match_terms(&self) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        let candidates = std::iter::once(&self.name)
            .chain(self.aliases.iter())
            .chain(self.keywords.iter());

        for term in candidates {
            let term = term.trim().to_lowercase();
            if !term.is_empty() && !terms.contains(&term) {
                terms.push(term);
            }
        }
        terms
    }

    /// Check if a name refers to this entry (name or alias, case-insensitive).
    pub fn matches_name(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return false;
        }
        self.name.to_lowercase() == query || self.aliases.iter().any(|a| a.to_lowercase() == query)
    }

    /// The text injected into prompts.
    pub fn render(&self) -> String {
        format!("[{}] {}: {}", self.entry_type.name(), self.name, self.description)
    }
}

/// Count how many of `terms` occur in `haystack` as whole words.
///
/// `haystack` must already be lowercase.
pub fn count_term_matches(terms: &[String], haystack: &str) -> usize {
    terms.iter().filter(|term| contains_word(haystack, term)).count()
}

/// Whole-word, already-lowercased substring search.
pub fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }

    let mut start = 0;
    while let Some(found) = haystack[start..].find(needle) {
        let begin = start + found;
        let end = begin + needle.len();

        let before_ok = haystack[..begin]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());

        if before_ok && after_ok {
            return true;
        }

        // Advance by one character to keep slicing on a char boundary.
        start = begin
            + haystack[begin..]
                .chars()
                .next()
                .map_or(1, char::len_utf8);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_word_respects_boundaries() {
        assert!(contains_word("the old mill burns", "mill"));
        assert!(!contains_word("a miller walks by", "mill"));
        assert!(contains_word("mill.", "mill"));
        assert!(contains_word("at the black gate", "black gate"));
    }

    #[test]
    fn test_contains_word_handles_unicode() {
        assert!(contains_word("élodie smiles", "élodie"));
        assert!(!contains_word("aélodie", "élodie"));
    }

    #[test]
    fn test_match_terms_dedup_and_lowercase() {
        let entry = LoreEntry::new(LoreType::Character, "Mara", "A smuggler")
            .with_alias("mara")
            .with_keywords(["Smuggler", " "]);
        assert_eq!(entry.match_terms(), vec!["mara".to_string(), "smuggler".to_string()]);
    }

    #[test]
    fn test_count_term_matches() {
        let entry = LoreEntry::new(LoreType::Location, "Iron Keep", "A fortress")
            .with_keywords(["fortress", "keep", "walls"]);
        let terms = entry.match_terms();
        assert_eq!(count_term_matches(&terms, "we reach the iron keep and its walls"), 3);
    }

    #[test]
    fn test_lore_type_parse() {
        assert_eq!(LoreType::parse("Characters"), Some(LoreType::Character));
        assert_eq!(LoreType::parse("spaceship"), None);
    }
}

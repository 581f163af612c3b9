//! Three-tier lorebook selection under a shared entry and token budget.
//!
//! Tier 1 is deterministic (always-on entries and entries tied to the live
//! scene), tier 2 matches keywords in the recent text window or recalls
//! entries that are still active, and tier 3 optionally asks a
//! [`LoreSelector`] to pick from what is left.

use super::activation::ActivationTracker;
use super::selector::LoreSelector;
use super::RetrievalError;
use crate::story::{
    count_term_matches, estimate_tokens, InjectionMode, LoreEntry, LoreId, StoryEntry, WorldState,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Limits and switches for tiered retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub tier1_max: usize,
    pub tier2_max: usize,
    pub tier3_max: usize,
    /// Cap on entries across all tiers.
    pub max_entries: usize,
    /// Cap on estimated tokens across all tiers.
    pub token_budget: usize,
    /// How many recent story entries form the keyword window.
    pub recent_window: usize,
    /// Minimum decayed activation weight for recall without a keyword match.
    pub activation_threshold: f32,
    pub llm_tier_enabled: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            tier1_max: 5,
            tier2_max: 8,
            tier3_max: 4,
            max_entries: 12,
            token_budget: 2000,
            recent_window: 4,
            activation_threshold: 0.5,
            llm_tier_enabled: false,
        }
    }
}

impl RetrievalConfig {
    pub fn with_tier_caps(mut self, tier1: usize, tier2: usize, tier3: usize) -> Self {
        self.tier1_max = tier1;
        self.tier2_max = tier2;
        self.tier3_max = tier3;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_token_budget(mut self, token_budget: usize) -> Self {
        self.token_budget = token_budget;
        self
    }

    pub fn with_llm_tier(mut self, enabled: bool) -> Self {
        self.llm_tier_enabled = enabled;
        self
    }
}

/// What the current turn looks like.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalRequest<'a> {
    pub user_input: &'a str,
    pub recent_entries: &'a [StoryEntry],
    /// Current story length; where activation is recorded.
    pub story_position: usize,
    pub world: Option<&'a WorldState>,
}

impl<'a> RetrievalRequest<'a> {
    pub fn new(user_input: &'a str, recent_entries: &'a [StoryEntry], story_position: usize) -> Self {
        Self {
            user_input,
            recent_entries,
            story_position,
            world: None,
        }
    }

    pub fn with_world(mut self, world: &'a WorldState) -> Self {
        self.world = Some(world);
        self
    }
}

/// Selected lore, per tier and combined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub tier1: Vec<LoreEntry>,
    pub tier2: Vec<LoreEntry>,
    pub tier3: Vec<LoreEntry>,
    /// Tier 1, then tier 2, then tier 3.
    pub all: Vec<LoreEntry>,
    /// Set when tier 3 failed and degraded to empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier3_error: Option<String>,
    pub cancelled: bool,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    pub fn ids(&self) -> Vec<LoreId> {
        self.all.iter().map(|e| e.id).collect()
    }

    /// Estimated tokens of everything selected.
    pub fn tokens(&self) -> usize {
        self.all.iter().map(entry_tokens).sum()
    }

    /// Prompt block listing the selected entries.
    pub fn render(&self) -> String {
        self.all
            .iter()
            .map(LoreEntry::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn finish(mut self, cancelled: bool) -> Self {
        self.all = self
            .tier1
            .iter()
            .chain(self.tier2.iter())
            .chain(self.tier3.iter())
            .cloned()
            .collect();
        self.cancelled = cancelled;
        self
    }
}

/// Tokens an entry costs when injected.
pub fn entry_tokens(entry: &LoreEntry) -> usize {
    estimate_tokens(&entry.name) + estimate_tokens(&entry.description)
}

/// Remaining entry and token allowance, shared across tiers.
#[derive(Debug, Clone, Copy)]
struct Budget {
    entries_left: usize,
    tokens_left: usize,
}

impl Budget {
    /// Take an entry if it fits.
    fn take(&mut self, entry: &LoreEntry) -> bool {
        let cost = entry_tokens(entry);
        if self.entries_left == 0 || cost > self.tokens_left {
            return false;
        }
        self.entries_left -= 1;
        self.tokens_left -= cost;
        true
    }

    fn exhausted(&self) -> bool {
        self.entries_left == 0 || self.tokens_left == 0
    }
}

/// Fill a tier from ranked candidates, skipping entries that don't fit.
fn fill_tier<'a>(
    ranked: impl IntoIterator<Item = &'a LoreEntry>,
    cap: usize,
    budget: &mut Budget,
    taken: &mut HashSet<LoreId>,
) -> Vec<LoreEntry> {
    let mut tier = Vec::new();
    for entry in ranked {
        if tier.len() >= cap || budget.exhausted() {
            break;
        }
        if taken.contains(&entry.id) {
            continue;
        }
        if budget.take(entry) {
            taken.insert(entry.id);
            tier.push(entry.clone());
        }
    }
    tier
}

/// Priority descending, then earlier creation, then input order.
fn base_order(a: (usize, &LoreEntry), b: (usize, &LoreEntry)) -> Ordering {
    b.1.priority
        .cmp(&a.1.priority)
        .then(a.1.created_at.cmp(&b.1.created_at))
        .then(a.0.cmp(&b.0))
}

/// The tiered retrieval engine.
#[derive(Clone, Default)]
pub struct TieredRetrieval {
    config: RetrievalConfig,
    selector: Option<Arc<dyn LoreSelector>>,
}

impl TieredRetrieval {
    pub fn new(config: RetrievalConfig) -> Self {
        Self {
            config,
            selector: None,
        }
    }

    /// Attach the tier 3 selector.
    pub fn with_selector(mut self, selector: Arc<dyn LoreSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Select lore for the current turn.
    ///
    /// When `tracker` is given, tier 2 reads activation weights from it and every
    /// tier 2 and tier 3 selection is recorded at `request.story_position`.
    /// Cancellation returns whatever tiers finished, with `cancelled` set.
    #[tracing::instrument(skip_all, fields(entries = entries.len(), position = request.story_position))]
    pub async fn select_context(
        &self,
        entries: &[LoreEntry],
        request: &RetrievalRequest<'_>,
        mut tracker: Option<&mut ActivationTracker>,
        cancel: &CancellationToken,
    ) -> RetrievalResult {
        let mut result = RetrievalResult::default();
        let mut budget = Budget {
            entries_left: self.config.max_entries,
            tokens_left: self.config.token_budget,
        };
        let mut taken = HashSet::new();

        if let Some(tracker) = tracker.as_deref_mut() {
            tracker.advance_to(request.story_position);
        }

        if cancel.is_cancelled() {
            return result.finish(true);
        }
        result.tier1 = self.tier1(entries, request, &mut budget, &mut taken);

        if cancel.is_cancelled() {
            return result.finish(true);
        }
        result.tier2 = self.tier2(entries, request, tracker.as_deref(), &mut budget, &mut taken);
        if let Some(tracker) = tracker.as_deref_mut() {
            for entry in &result.tier2 {
                tracker.record(entry.id, request.story_position);
            }
        }

        if cancel.is_cancelled() {
            return result.finish(true);
        }
        match self.tier3(entries, request, &mut budget, &mut taken, cancel).await {
            Ok(Some(tier3)) => {
                if let Some(tracker) = tracker.as_deref_mut() {
                    for entry in &tier3 {
                        tracker.record(entry.id, request.story_position);
                    }
                }
                result.tier3 = tier3;
            }
            Ok(None) => return result.finish(true),
            Err(e) => {
                warn!(error = %e, "Tier 3 lore selection failed, continuing without it");
                result.tier3_error = Some(e.to_string());
            }
        }

        if let Some(tracker) = tracker {
            tracker.prune();
        }

        debug!(
            tier1 = result.tier1.len(),
            tier2 = result.tier2.len(),
            tier3 = result.tier3.len(),
            tokens_left = budget.tokens_left,
            "Selected lore"
        );
        result.finish(false)
    }

    fn tier1(
        &self,
        entries: &[LoreEntry],
        request: &RetrievalRequest<'_>,
        budget: &mut Budget,
        taken: &mut HashSet<LoreId>,
    ) -> Vec<LoreEntry> {
        let scene_names = request.world.map(scene_names).unwrap_or_default();

        let mut candidates: Vec<(usize, &LoreEntry)> = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| match entry.injection {
                InjectionMode::Always => true,
                InjectionMode::Never => false,
                InjectionMode::Keyword | InjectionMode::Relevant => {
                    scene_names.iter().any(|name| entry.matches_name(name))
                }
            })
            .collect();
        candidates.sort_by(|a, b| base_order(*a, *b));

        fill_tier(
            candidates.into_iter().map(|(_, entry)| entry),
            self.config.tier1_max,
            budget,
            taken,
        )
    }

    fn tier2(
        &self,
        entries: &[LoreEntry],
        request: &RetrievalRequest<'_>,
        tracker: Option<&ActivationTracker>,
        budget: &mut Budget,
        taken: &mut HashSet<LoreId>,
    ) -> Vec<LoreEntry> {
        let window = window_text(request, self.config.recent_window);

        let mut scored: Vec<(usize, &LoreEntry, usize, f32)> = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.injection != InjectionMode::Never && !taken.contains(&entry.id))
            .filter_map(|(index, entry)| {
                let matches = count_term_matches(&entry.match_terms(), &window);
                let weight = tracker.map_or(0.0, |t| t.weight(&entry.id));
                let recalled = tracker.is_some() && weight >= self.config.activation_threshold;
                (matches > 0 || recalled).then_some((index, entry, matches, weight))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.2.cmp(&a.2)
                .then(b.3.partial_cmp(&a.3).unwrap_or(Ordering::Equal))
                .then_with(|| base_order((a.0, a.1), (b.0, b.1)))
        });

        fill_tier(
            scored.into_iter().map(|(_, entry, _, _)| entry),
            self.config.tier2_max,
            budget,
            taken,
        )
    }

    /// `Ok(None)` means cancelled while waiting on the selector.
    async fn tier3(
        &self,
        entries: &[LoreEntry],
        request: &RetrievalRequest<'_>,
        budget: &mut Budget,
        taken: &mut HashSet<LoreId>,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<LoreEntry>>, RetrievalError> {
        let Some(selector) = self.selector.as_ref().filter(|_| self.config.llm_tier_enabled) else {
            return Ok(Some(Vec::new()));
        };
        if budget.exhausted() || self.config.tier3_max == 0 {
            return Ok(Some(Vec::new()));
        }

        let candidates: Vec<LoreEntry> = entries
            .iter()
            .filter(|entry| {
                matches!(entry.injection, InjectionMode::Relevant | InjectionMode::Keyword)
                    && !taken.contains(&entry.id)
            })
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let recent = window_text(request, self.config.recent_window);
        let picked = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            picked = selector.select(request.user_input, &recent, &candidates, self.config.tier3_max) => picked?,
        };

        let mut seen = HashSet::new();
        let ranked = picked
            .iter()
            .filter(|id| seen.insert(**id))
            .filter_map(|id| candidates.iter().find(|entry| entry.id == *id));

        Ok(Some(fill_tier(ranked, self.config.tier3_max, budget, taken)))
    }
}

/// Lowercased user input plus the last `window` story entries.
fn window_text(request: &RetrievalRequest<'_>, window: usize) -> String {
    let start = request.recent_entries.len().saturating_sub(window);
    let mut text = request.user_input.to_lowercase();
    for entry in &request.recent_entries[start..] {
        text.push('\n');
        text.push_str(&entry.content.to_lowercase());
    }
    text
}

/// Names the live scene refers to: current location, present characters,
/// carried items.
fn scene_names(world: &WorldState) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    if let Some(location) = &world.scene.current_location {
        names.push(location.clone());
    }
    names.extend(world.scene.present_characters.iter().cloned());
    names.extend(world.inventory().map(str::to_string));
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::ActivationConfig;
    use crate::story::LoreType;

    fn lore(name: &str, injection: InjectionMode, keywords: &[&str], created_at: i64) -> LoreEntry {
        LoreEntry::new(LoreType::Concept, name, format!("About {name}"))
            .with_injection(injection)
            .with_keywords(keywords.iter().copied())
            .with_created_at(created_at)
    }

    #[tokio::test]
    async fn test_always_entries_ordered_by_priority() {
        let entries = vec![
            lore("Low", InjectionMode::Always, &[], 1),
            lore("High", InjectionMode::Always, &[], 2).with_priority(5),
        ];
        let engine = TieredRetrieval::new(RetrievalConfig::default());
        let request = RetrievalRequest::new("hello", &[], 0);

        let result = engine
            .select_context(&entries, &request, None, &CancellationToken::new())
            .await;

        let names: Vec<_> = result.tier1.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["High", "Low"]);
        assert!(result.tier2.is_empty());
    }

    #[tokio::test]
    async fn test_scene_entries_join_tier1() {
        let entries = vec![lore("Harbor", InjectionMode::Relevant, &[], 1)];
        let mut world = WorldState::new();
        world.scene.current_location = Some("harbor".to_string());

        let engine = TieredRetrieval::new(RetrievalConfig::default());
        let request = RetrievalRequest::new("look around", &[], 0).with_world(&world);
        let result = engine
            .select_context(&entries, &request, None, &CancellationToken::new())
            .await;

        assert_eq!(result.tier1.len(), 1);
    }

    #[tokio::test]
    async fn test_tier2_matches_window_and_skips_never() {
        let entries = vec![
            lore("Mill", InjectionMode::Keyword, &["grain"], 1),
            lore("Secret", InjectionMode::Never, &["grain"], 2),
            lore("Forest", InjectionMode::Keyword, &[], 3),
        ];
        let recent = vec![StoryEntry::narration("Sacks of grain are piled high.")];
        let engine = TieredRetrieval::new(RetrievalConfig::default());
        let request = RetrievalRequest::new("I head to the mill", &recent, 1);

        let result = engine
            .select_context(&entries, &request, None, &CancellationToken::new())
            .await;

        let names: Vec<_> = result.tier2.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Mill"]);
    }

    #[tokio::test]
    async fn test_tier2_records_activation_and_recalls() {
        let entries = vec![lore("Mara", InjectionMode::Keyword, &[], 1)];
        let engine = TieredRetrieval::new(RetrievalConfig::default());
        let mut tracker = ActivationTracker::new(ActivationConfig::default());
        let cancel = CancellationToken::new();

        let first = RetrievalRequest::new("I call for Mara", &[], 2);
        let result = engine
            .select_context(&entries, &first, Some(&mut tracker), &cancel)
            .await;
        assert_eq!(result.tier2.len(), 1);
        assert!(tracker.weight(&entries[0].id) > 0.9);

        // No mention, but still active one position later.
        let second = RetrievalRequest::new("I wait", &[], 3);
        let result = engine
            .select_context(&entries, &second, Some(&mut tracker), &cancel)
            .await;
        assert_eq!(result.tier2.len(), 1);
        assert_eq!(tracker.position(), 3);
    }

    #[tokio::test]
    async fn test_token_budget_skips_oversized_entries() {
        let big = LoreEntry::new(LoreType::Event, "War", "x".repeat(400)).with_keywords(["war"]);
        let small = LoreEntry::new(LoreType::Event, "Truce", "short").with_keywords(["war"]);
        let entries = vec![big, small];

        let engine = TieredRetrieval::new(RetrievalConfig::default().with_token_budget(20));
        let request = RetrievalRequest::new("the war", &[], 0);
        let result = engine
            .select_context(&entries, &request, None, &CancellationToken::new())
            .await;

        assert_eq!(result.tier2.len(), 1);
        assert_eq!(result.tier2[0].name, "Truce");
        assert!(result.tokens() <= 20);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let entries = vec![lore("A", InjectionMode::Always, &[], 1)];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let engine = TieredRetrieval::new(RetrievalConfig::default());
        let request = RetrievalRequest::new("", &[], 0);
        let result = engine.select_context(&entries, &request, None, &cancel).await;

        assert!(result.cancelled);
        assert!(result.all.is_empty());
    }
}

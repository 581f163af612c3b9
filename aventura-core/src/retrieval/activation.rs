//! Activation tracking: which lore entries the narrative has recently touched.
//!
//! Each record keeps the weight it had when last seen; reading it applies
//! exponential decay per story position elapsed since then.

use crate::story::LoreId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tuning for activation decay and boost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    /// Multiplier applied per story position elapsed (0..=1).
    pub decay: f32,
    /// Weight added each time an entry is seen.
    pub boost: f32,
    /// Upper bound on any weight.
    pub max_weight: f32,
    /// Records whose decayed weight falls below this are pruned.
    pub prune_below: f32,
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            decay: 0.85,
            boost: 1.0,
            max_weight: 3.0,
            prune_below: 0.05,
        }
    }
}

impl ActivationConfig {
    pub fn with_decay(mut self, decay: f32) -> Self {
        self.decay = decay.clamp(0.0, 1.0);
        self
    }

    pub fn with_boost(mut self, boost: f32) -> Self {
        self.boost = boost;
        self
    }
}

/// One entry's activation at the time it was last seen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub last_seen_position: usize,
    pub weight: f32,
}

/// Serializable tracker state; what backups capture and restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivationState {
    pub position: usize,
    pub records: BTreeMap<LoreId, ActivationRecord>,
}

/// Per-story decay/boost ledger.
#[derive(Debug, Clone, Default)]
pub struct ActivationTracker {
    config: ActivationConfig,
    state: ActivationState,
}

impl ActivationTracker {
    pub fn new(config: ActivationConfig) -> Self {
        Self {
            config,
            state: ActivationState::default(),
        }
    }

    pub fn from_state(config: ActivationConfig, state: ActivationState) -> Self {
        Self { config, state }
    }

    pub fn config(&self) -> &ActivationConfig {
        &self.config
    }

    pub fn position(&self) -> usize {
        self.state.position
    }

    pub fn len(&self) -> usize {
        self.state.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.records.is_empty()
    }

    /// Move the tracker forward. The position never goes backwards.
    pub fn advance_to(&mut self, position: usize) {
        self.state.position = self.state.position.max(position);
    }

    /// Current decayed weight of an entry (0 if never seen).
    pub fn weight(&self, id: &LoreId) -> f32 {
        self.state
            .records
            .get(id)
            .map(|record| self.decayed(record))
            .unwrap_or(0.0)
    }

    fn decayed(&self, record: &ActivationRecord) -> f32 {
        let elapsed = self.state.position.saturating_sub(record.last_seen_position);
        let exponent = i32::try_from(elapsed).unwrap_or(i32::MAX);
        record.weight * self.config.decay.powi(exponent)
    }

    /// Record that an entry was injected at `position`.
    pub fn record(&mut self, id: LoreId, position: usize) {
        self.advance_to(position);
        let weight = (self.weight(&id) + self.config.boost).min(self.config.max_weight);
        self.state.records.insert(
            id,
            ActivationRecord {
                last_seen_position: self.state.position,
                weight,
            },
        );
    }

    /// Entries whose decayed weight is at least `threshold`, strongest first.
    pub fn active_entries(&self, threshold: f32) -> Vec<(LoreId, f32)> {
        let mut active: Vec<(LoreId, f32)> = self
            .state
            .records
            .iter()
            .map(|(id, record)| (*id, self.decayed(record)))
            .filter(|(_, weight)| *weight >= threshold)
            .collect();

        active.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        active
    }

    /// Drop records that have decayed below `prune_below`.
    pub fn prune(&mut self) {
        let position = self.state.position;
        let decay = self.config.decay;
        let floor = self.config.prune_below;
        self.state.records.retain(|_, record| {
            let elapsed = i32::try_from(position.saturating_sub(record.last_seen_position))
                .unwrap_or(i32::MAX);
            record.weight * decay.powi(elapsed) >= floor
        });
    }

    pub fn snapshot(&self) -> ActivationState {
        self.state.clone()
    }

    pub fn restore(&mut self, state: ActivationState) {
        self.state = state;
    }

    pub fn clear(&mut self) {
        self.state = ActivationState::default();
    }
}

//! Lore and history retrieval for prompt context.

mod activation;
mod selector;
mod tiered;
mod timeline;

pub use activation::{ActivationConfig, ActivationRecord, ActivationState, ActivationTracker};
pub use selector::{LoreSelector, ModelLoreSelector};
pub use tiered::{entry_tokens, RetrievalConfig, RetrievalRequest, RetrievalResult, TieredRetrieval};
pub use timeline::{ModelTimelineFill, TimelineFill, MAX_QUERY_SPAN, MAX_TIMELINE_QUERIES};

use thiserror::Error;

/// Errors from optional retrieval steps. None of these fail a turn.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Provider error: {0}")]
    Provider(#[from] claude::Error),

    #[error("Failed to parse model response: {0}")]
    Parse(String),

    #[error("Chapter query failed: {0}")]
    Query(String),
}

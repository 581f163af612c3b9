//! Events emitted by the generation pipeline.

use crate::agentic::AgenticRetrievalResult;
use crate::classifier::ClassificationResult;
use crate::retrieval::RetrievalResult;
use crate::story::{EntityKind, EntryId};
use crate::suggestions::{ActionChoice, Suggestion};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The five pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreGeneration,
    Narrative,
    Classification,
    Translation,
    PostGeneration,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::PreGeneration => "pre_generation",
            Phase::Narrative => "narrative",
            Phase::Classification => "classification",
            Phase::Translation => "translation",
            Phase::PostGeneration => "post_generation",
        };
        f.write_str(name)
    }
}

/// Output of the pre-generation phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreGenerationOutput {
    pub retrieval: RetrievalResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agentic: Option<AgenticRetrievalResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline_context: Option<String>,
}

/// A translated world entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslatedEntity {
    pub kind: EntityKind,
    pub original_name: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Output of the translation phase. Missing pieces keep their original text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranslationOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative: Option<String>,
    #[serde(default)]
    pub entities: Vec<TranslatedEntity>,
}

/// Output of the post-generation phase. `None` means the branch did not run or failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostGenerationOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<Suggestion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_choices: Option<Vec<ActionChoice>>,
}

/// Phase-specific payload of `phase_complete`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseResult {
    PreGeneration(PreGenerationOutput),
    Narrative { content: String, reasoning: String },
    Classification,
    Translation(TranslationOutcome),
    PostGeneration(PostGenerationOutput),
}

impl PhaseResult {
    pub fn phase(&self) -> Phase {
        match self {
            PhaseResult::PreGeneration(_) => Phase::PreGeneration,
            PhaseResult::Narrative { .. } => Phase::Narrative,
            PhaseResult::Classification => Phase::Classification,
            PhaseResult::Translation(_) => Phase::Translation,
            PhaseResult::PostGeneration(_) => Phase::PostGeneration,
        }
    }
}

/// Everything the pipeline tells its caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    PhaseStart {
        phase: Phase,
    },
    /// A streamed delta of narration or reasoning.
    NarrativeChunk {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        content: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reasoning: String,
    },
    PhaseComplete {
        result: PhaseResult,
    },
    ClassificationComplete {
        result: ClassificationResult,
    },
    /// The turn was cancelled; nothing follows.
    Aborted {
        phase: Phase,
    },
    Error {
        fatal: bool,
        message: String,
        phase: Phase,
        /// The user-action entry to reuse when retrying a fatal failure.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_entry_id: Option<EntryId>,
    },
}

impl PipelineEvent {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineEvent::Error { fatal: true, .. })
    }

    /// Whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineEvent::Aborted { .. }) || self.is_fatal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_events_are_tagged() {
        let event = PipelineEvent::PhaseStart {
            phase: Phase::Narrative,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "phase_start", "phase": "narrative"})
        );

        let event = PipelineEvent::NarrativeChunk {
            content: "The door".to_string(),
            reasoning: String::new(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "narrative_chunk", "content": "The door"})
        );
    }

    #[test]
    fn test_phase_complete_round_trips() {
        let event = PipelineEvent::PhaseComplete {
            result: PhaseResult::Narrative {
                content: "Done.".to_string(),
                reasoning: String::new(),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"narrative\""));
        assert_eq!(serde_json::from_str::<PipelineEvent>(&json).unwrap(), event);
    }

    #[test]
    fn test_phases_are_ordered() {
        assert!(Phase::PreGeneration < Phase::Narrative);
        assert!(Phase::Translation < Phase::PostGeneration);
    }
}

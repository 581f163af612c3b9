//! Turn generation: context assembly, narrative streaming, classification,
//! translation and follow-up generation.

mod config;
mod context;
mod events;
mod runner;

pub use config::{
    MemoryConfig, MemoryMode, NarrativeConfig, PipelineConfig, PostGenerationConfig, StoryMode,
    TranslationConfig,
};
pub use context::{GenerationContext, PipelineDependencies, UserActionInput};
pub use events::{
    Phase, PhaseResult, PipelineEvent, PostGenerationOutput, PreGenerationOutput, TranslatedEntity,
    TranslationOutcome,
};
pub use runner::{GenerationPipeline, PipelineStream};

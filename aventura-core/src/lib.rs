//! Narrative generation core for interactive fiction.
//!
//! This crate provides:
//! - Tiered lore retrieval with activation decay
//! - An agentic retrieval loop that questions past chapters through tools
//! - A cancellable generation pipeline streaming phase events
//! - Pre-turn backups and exact rollback for stop and retry
//!
//! # Quick Start
//!
//! ```ignore
//! use aventura_core::pipeline::{GenerationPipeline, PipelineConfig, PipelineDependencies};
//! use aventura_core::{ActivationTracker, ModelClassifier, StorySession, UserAction};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let provider = Arc::new(claude::Claude::from_env()?);
//!     let deps = PipelineDependencies::new(
//!         provider.clone(),
//!         Arc::new(ModelClassifier::new(provider)),
//!         Arc::new(tokio::sync::Mutex::new(ActivationTracker::default())),
//!     );
//!     let pipeline = GenerationPipeline::new(PipelineConfig::default(), deps);
//!
//!     let session = StorySession::new(pipeline, my_store(), my_ui());
//!     let report = session.submit_action(UserAction::new("I open the door")).await?;
//!     println!("{}", report.narrative);
//!     Ok(())
//! }
//! ```

pub mod agentic;
pub mod classifier;
mod json;
pub mod pipeline;
pub mod provider;
pub mod retrieval;
pub mod rollback;
pub mod session;
pub mod store;
pub mod story;
pub mod suggestions;
pub mod testing;
pub mod translation;

pub use aventura_macros::Tool;

pub use agentic::{AgenticConfig, AgenticRetrieval, AgenticRetrievalResult, ChapterArchive, ChapterQuery};
pub use classifier::{ClassificationResult, Classifier, ModelClassifier};
pub use pipeline::{GenerationPipeline, PipelineConfig, PipelineDependencies, PipelineEvent};
pub use provider::Provider;
pub use retrieval::{ActivationTracker, RetrievalConfig, RetrievalResult, TieredRetrieval};
pub use rollback::{RetryBackup, RollbackManager, TurnGate};
pub use session::{SessionError, StorySession, TurnOutcome, TurnReport, UserAction};
pub use store::{StoreError, StoryStore, UiOps};
pub use suggestions::ModelSuggestions;
pub use translation::{ModelTranslator, Translator};

//! Integration tests that call the real Claude API.
//!
//! These tests require ANTHROPIC_API_KEY to be set (via .env file or environment).
//! Run with: `cargo test -p aventura-core --test api_integration -- --ignored`

use aventura_core::pipeline::{
    GenerationContext, GenerationPipeline, Phase, PipelineConfig, PipelineDependencies, PipelineEvent,
    UserActionInput,
};
use aventura_core::retrieval::ActivationTracker;
use aventura_core::story::{LoreEntry, LoreType, StoryEntry, StoryId, WorldState};
use aventura_core::testing::{collect_events, MemoryStore, RecordingUi};
use aventura_core::{ModelClassifier, ModelSuggestions, StorySession, TurnOutcome, UserAction};
use claude::Claude;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const TEST_MODEL: &str = "claude-sonnet-4-20250514";

/// Load environment variables from .env file
fn setup() {
    let _ = dotenvy::dotenv();
}

fn has_api_key() -> bool {
    std::env::var("ANTHROPIC_API_KEY").is_ok()
}

fn live_pipeline() -> GenerationPipeline {
    let provider = Arc::new(Claude::from_env().expect("Failed to create client"));
    let deps = PipelineDependencies::new(
        provider.clone(),
        Arc::new(ModelClassifier::new(provider.clone()).with_model(TEST_MODEL)),
        Arc::new(Mutex::new(ActivationTracker::default())),
    )
    .with_action_choices(Arc::new(ModelSuggestions::new(provider).with_model(TEST_MODEL)));
    GenerationPipeline::new(PipelineConfig::default().with_model(TEST_MODEL), deps)
}

fn harbor_world() -> WorldState {
    let mut world = WorldState::new();
    world.add_character("Mara", "A smuggler with a scarred hand", 0);
    world.add_location("Harbor", "Salt, tar and gulls", 0);
    world.scene.current_location = Some("Harbor".to_string());
    world
}

#[tokio::test]
#[ignore] // Run with: cargo test -p aventura-core --test api_integration -- --ignored
async fn test_pipeline_runs_every_phase() {
    setup();
    if !has_api_key() {
        eprintln!("Skipping test: ANTHROPIC_API_KEY not set");
        return;
    }

    let pipeline = live_pipeline();
    let ctx = GenerationContext::new(StoryId::new(), UserActionInput::new("I ask Mara about the missing ship"))
        .with_entries(vec![StoryEntry::narration(
            "Fog rolls over the harbor. Mara mends a net by the pier.",
        )])
        .with_lore(vec![LoreEntry::new(
            LoreType::Character,
            "Mara",
            "Mara lost her brother when the Gull sank.",
        )
        .with_keywords(["mara"])])
        .with_world(harbor_world());

    let events = collect_events(pipeline.execute(ctx, CancellationToken::new())).await;

    for event in &events {
        if let PipelineEvent::Error { message, fatal, .. } = event {
            eprintln!("pipeline error (fatal={fatal}): {message}");
        }
    }
    assert!(
        events.iter().any(|e| matches!(e, PipelineEvent::ClassificationComplete { .. })),
        "Classification should complete"
    );
    let narrative: String = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::NarrativeChunk { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert!(!narrative.trim().is_empty(), "Narrator should produce text");
    assert!(events
        .iter()
        .any(|e| matches!(e, PipelineEvent::PhaseStart { phase: Phase::PostGeneration })));
}

#[tokio::test]
#[ignore] // Run with: cargo test -p aventura-core --test api_integration -- --ignored
async fn test_session_turn_then_stop_restores_world() {
    setup();
    if !has_api_key() {
        eprintln!("Skipping test: ANTHROPIC_API_KEY not set");
        return;
    }

    let story = StoryId::new();
    let store = Arc::new(MemoryStore::new());
    store.set_world(story, harbor_world());
    let before = serde_json::to_string(&store.world_of(story)).unwrap();
    let session = StorySession::new(live_pipeline(), store.clone(), Arc::new(RecordingUi::new(Some(story))));

    let report = session
        .submit_action(UserAction::new("I follow Mara down the pier to a boathouse"))
        .await
        .expect("Turn should run");
    assert_eq!(report.outcome, TurnOutcome::Completed, "warnings: {:?}", report.warnings);
    assert_eq!(store.entries_of(story).len(), 2);

    assert!(session.stop_generation().await.success);
    assert!(store.entries_of(story).is_empty());
    assert_eq!(serde_json::to_string(&store.world_of(story)).unwrap(), before);
}

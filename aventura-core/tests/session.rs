//! Turn driving, stop, retry and rollback through StorySession.

use async_trait::async_trait;
use aventura_core::classifier::{
    CharacterUpdate, ClassificationResult, Classifier, ClassifierError, NewLocation, SceneUpdate,
};
use aventura_core::pipeline::{GenerationPipeline, PipelineConfig, PipelineDependencies};
use aventura_core::retrieval::ActivationTracker;
use aventura_core::rollback::ActionType;
use aventura_core::store::UiOps;
use aventura_core::story::{
    EntryType, LoreEntry, LoreType, StoryEntry, StoryId, TimeProgression, TimeTracker, WorldState,
};
use aventura_core::testing::{MemoryStore, MockProvider, MockTurn, RecordingUi, ScriptedClassifier};
use aventura_core::{SessionError, StorySession, TurnOutcome, UserAction};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct Harness {
    story: StoryId,
    store: Arc<MemoryStore>,
    ui: Arc<RecordingUi>,
    activation: Arc<Mutex<ActivationTracker>>,
    provider: Arc<MockProvider>,
    session: Arc<StorySession>,
}

fn harness(provider: MockProvider, classifier: Arc<dyn Classifier>) -> Harness {
    let story = StoryId::new();
    let store = Arc::new(MemoryStore::new());
    store.set_entries(
        story,
        vec![
            StoryEntry::user_action("I wake up"),
            StoryEntry::narration("Rain drums on the roof of the inn."),
        ],
    );
    let mut world = WorldState::new();
    world.add_character("Mara", "The innkeeper", 10);
    world.add_location("Inn", "The Drowned Rat", 10);
    world.scene.current_location = Some("Inn".to_string());
    world.locations[0].current = true;
    world.locations[0].visited = true;
    store.set_world(story, world);
    store.set_lore(
        story,
        vec![LoreEntry::new(LoreType::Location, "Drowned Rat", "A smugglers' inn.").with_keywords(["inn"])],
    );

    let ui = Arc::new(RecordingUi::new(Some(story)));
    let provider = Arc::new(provider);
    let activation = Arc::new(Mutex::new(ActivationTracker::default()));
    let deps = PipelineDependencies::new(provider.clone(), classifier, activation.clone());
    let pipeline = GenerationPipeline::new(PipelineConfig::default(), deps);
    let session = Arc::new(StorySession::new(pipeline, store.clone(), ui.clone()));

    Harness {
        story,
        store,
        ui,
        activation,
        provider,
        session,
    }
}

fn descend() -> ClassificationResult {
    ClassificationResult {
        new_locations: vec![NewLocation {
            name: "Cellar".to_string(),
            description: "Barrels and damp stone".to_string(),
        }],
        character_updates: vec![CharacterUpdate {
            name: "Mara".to_string(),
            disposition: Some("suspicious".to_string()),
            ..Default::default()
        }],
        scene: SceneUpdate {
            present_characters: vec!["Mara".to_string()],
            current_location: Some("Cellar".to_string()),
            time_progression: TimeProgression::Hours(1),
        },
        ..Default::default()
    }
}

/// Fails the first classification, then succeeds.
struct FlakyClassifier {
    calls: AtomicUsize,
}

#[async_trait]
impl Classifier for FlakyClassifier {
    async fn classify(
        &self,
        _narrative: &str,
        _user_action: &str,
        _world: &WorldState,
    ) -> Result<ClassificationResult, ClassifierError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ClassifierError::Failed("model returned prose".to_string()));
        }
        Ok(ClassificationResult::default())
    }
}

#[tokio::test]
async fn test_completed_turn_commits_everything() {
    let h = harness(
        MockProvider::new().with_turn(MockTurn::chunks(["You take the stairs ", "down to the cellar."])),
        Arc::new(ScriptedClassifier::new(descend())),
    );

    let report = h
        .session
        .submit_action(UserAction::new("I go down to the cellar"))
        .await
        .unwrap();

    assert_eq!(report.outcome, TurnOutcome::Completed);
    let entries = h.store.entries_of(h.story);
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[2].id, report.user_action_entry_id);
    assert_eq!(entries[2].entry_type, EntryType::UserAction);
    assert_eq!(entries[3].content, "You take the stairs down to the cellar.");
    assert_eq!(Some(entries[3].id), report.narration_entry_id);

    let world = h.store.world_of(h.story);
    assert_eq!(world.scene.current_location.as_deref(), Some("Cellar"));
    assert_eq!(world.character("Mara").unwrap().disposition.as_deref(), Some("suspicious"));
    assert_eq!(h.store.time_of(h.story).hour, TimeTracker::default().hour + 1);
    assert!(!h.ui.is_generating());
}

#[tokio::test]
async fn test_stop_mid_stream_restores_pre_turn_state() {
    let h = harness(
        MockProvider::new().with_turn(MockTurn::chunks(["The door ", "creaks"]).then_stall()),
        Arc::new(ScriptedClassifier::new(descend())),
    );
    let entries_before = h.store.entries_of(h.story);

    let session = h.session.clone();
    let turn = tokio::spawn(async move { session.submit_action(UserAction::new("I open the inn door")).await });

    // Wait for the narrative request; retrieval has run by then.
    while h.provider.requests().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!h.activation.lock().await.is_empty());

    let stopped = h.session.stop_generation().await;
    assert!(stopped.success);

    let report = turn.await.unwrap().unwrap();
    assert_eq!(report.outcome, TurnOutcome::Aborted);
    assert_eq!(h.store.entries_of(h.story), entries_before);
    assert!(h.activation.lock().await.is_empty());
    assert!(!h.ui.is_generating());
}

#[tokio::test]
async fn test_failed_turn_persists_only_system_entry() {
    let h = harness(
        MockProvider::new()
            .with_turn(MockTurn::text("The guard laughs."))
            .with_turn(MockTurn::text("The guard nods.")),
        Arc::new(FlakyClassifier {
            calls: AtomicUsize::new(0),
        }),
    );

    let report = h.session.submit_action(UserAction::new("I bribe the guard")).await.unwrap();

    let TurnOutcome::Failed { message } = &report.outcome else {
        panic!("expected a failed turn, got {:?}", report.outcome);
    };
    assert!(message.contains("model returned prose"));
    let entries = h.store.entries_of(h.story);
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2].entry_type, EntryType::System);
    assert!(entries[2].content.starts_with("Generation failed: "));
    assert!(h.session.has_failed_turn().await);

    let retried = h.session.retry_failed_generation().await.unwrap().unwrap();

    assert_eq!(retried.outcome, TurnOutcome::Completed);
    assert_eq!(retried.user_action_entry_id, report.user_action_entry_id);
    let entries = h.store.entries_of(h.story);
    assert_eq!(entries.len(), 4);
    assert!(entries.iter().all(|e| e.entry_type != EntryType::System));
    assert_eq!(entries[2].id, report.user_action_entry_id);
    assert_eq!(entries[3].content, "The guard nods.");
    assert!(!h.session.has_failed_turn().await);
}

#[tokio::test]
async fn test_rollback_is_exact_and_idempotent() {
    let h = harness(
        MockProvider::new().with_turn(MockTurn::text("You descend.")),
        Arc::new(ScriptedClassifier::new(descend())),
    );
    let world_before = serde_json::to_string(&h.store.world_of(h.story)).unwrap();
    let entries_before = h.store.entries_of(h.story);
    let time_before = h.store.time_of(h.story);

    h.session
        .submit_action(UserAction::new("I go down to the cellar"))
        .await
        .unwrap();
    assert_ne!(serde_json::to_string(&h.store.world_of(h.story)).unwrap(), world_before);

    assert!(h.session.stop_generation().await.success);
    assert_eq!(serde_json::to_string(&h.store.world_of(h.story)).unwrap(), world_before);
    assert_eq!(h.store.entries_of(h.story), entries_before);
    assert_eq!(h.store.time_of(h.story), time_before);

    // The backup is consumed; a second stop changes nothing.
    assert!(!h.session.stop_generation().await.success);
    assert_eq!(serde_json::to_string(&h.store.world_of(h.story)).unwrap(), world_before);
    assert_eq!(h.store.entries_of(h.story), entries_before);
}

#[tokio::test]
async fn test_stop_before_backup_keeps_previous_turn() {
    let h = harness(
        MockProvider::new().with_turn(MockTurn::text("You descend.")),
        Arc::new(ScriptedClassifier::new(descend())),
    );
    h.session
        .submit_action(UserAction::new("I go down to the cellar"))
        .await
        .unwrap();
    let entries_after_first = h.store.entries_of(h.story);
    let world_after_first = serde_json::to_string(&h.store.world_of(h.story)).unwrap();
    let requests = h.provider.requests().len();

    // The second turn is still reading the story when it is stopped.
    h.store.set_entries_delay(Some(Duration::from_millis(200)));
    let session = h.session.clone();
    let turn = tokio::spawn(async move { session.submit_action(UserAction::new("I open a barrel")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopped = h.session.stop_generation().await;
    let report = turn.await.unwrap().unwrap();
    h.store.set_entries_delay(None);

    assert!(stopped.success);
    assert_eq!(report.outcome, TurnOutcome::Aborted);
    assert_eq!(h.store.entries_of(h.story), entries_after_first);
    assert_eq!(serde_json::to_string(&h.store.world_of(h.story)).unwrap(), world_after_first);
    assert_eq!(h.provider.requests().len(), requests);
    assert!(h.session.rollback().has_backup_for(h.story).await);
    assert!(!h.ui.is_generating());
}

#[tokio::test]
async fn test_failed_rollback_can_be_repeated() {
    let h = harness(
        MockProvider::new().with_turn(MockTurn::text("You descend.")),
        Arc::new(ScriptedClassifier::new(descend())),
    );
    let world_before = serde_json::to_string(&h.store.world_of(h.story)).unwrap();
    let entries_before = h.store.entries_of(h.story);
    let time_before = h.store.time_of(h.story);

    h.session
        .submit_action(UserAction::new("I go down to the cellar"))
        .await
        .unwrap();
    h.store.fail_entity_deletes(1);

    assert!(!h.session.stop_generation().await.success);
    assert!(h.session.rollback().has_backup_for(h.story).await);

    assert!(h.session.stop_generation().await.success);
    assert_eq!(serde_json::to_string(&h.store.world_of(h.story)).unwrap(), world_before);
    assert_eq!(h.store.entries_of(h.story), entries_before);
    assert_eq!(h.store.time_of(h.story), time_before);
    assert!(!h.session.rollback().has_backup_for(h.story).await);
}

#[tokio::test]
async fn test_retry_last_message_regenerates() {
    let h = harness(
        MockProvider::new()
            .with_turn(MockTurn::text("The door is locked."))
            .with_turn(MockTurn::text("The door swings open.")),
        Arc::new(ScriptedClassifier::default()),
    );

    let first = h
        .session
        .submit_action(UserAction::new("the door").with_action_type(ActionType::Say))
        .await
        .unwrap();
    let retried = h.session.retry_last_message().await.unwrap().unwrap();

    assert_eq!(retried.user_action_entry_id, first.user_action_entry_id);
    let entries = h.store.entries_of(h.story);
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[2].content, "You say: \"the door\"");
    assert_eq!(entries[3].content, "The door swings open.");

    // The retried turn's input went to the narrator unchanged.
    let requests = h.provider.requests();
    assert_eq!(requests[0].messages.last(), requests[1].messages.last());
}

#[tokio::test]
async fn test_retry_is_ignored_while_generating() {
    let h = harness(MockProvider::new(), Arc::new(ScriptedClassifier::default()));
    h.ui.set_generating(true);

    assert!(h.session.retry_last_message().await.unwrap().is_none());
    assert!(h.session.retry_failed_generation().await.unwrap().is_none());
    assert!(matches!(
        h.session.submit_action(UserAction::new("hello")).await,
        Err(SessionError::Busy)
    ));
    assert!(h.provider.requests().is_empty());
}

#[tokio::test]
async fn test_switch_story_drops_old_turn_state() {
    let h = harness(
        MockProvider::new().with_turn(MockTurn::text("The guard laughs.")),
        Arc::new(ScriptedClassifier::failing("bad JSON")),
    );
    h.session.submit_action(UserAction::new("I bribe the guard")).await.unwrap();
    assert!(h.session.has_failed_turn().await);

    let other = StoryId::new();
    h.session.switch_story(other).await;

    assert_eq!(h.ui.active_story(), Some(other));
    assert!(!h.session.has_failed_turn().await);
    assert!(h.session.rollback().backup().await.is_none());
    assert!(h.activation.lock().await.is_empty());
    assert!(h.session.retry_failed_generation().await.unwrap().is_none());
}

#[tokio::test]
async fn test_no_active_story() {
    let h = harness(MockProvider::new(), Arc::new(ScriptedClassifier::default()));
    let ui = Arc::new(RecordingUi::new(None));
    let session = StorySession::new(h.session.pipeline().clone(), h.store.clone(), ui);

    assert!(matches!(
        session.submit_action(UserAction::new("hello")).await,
        Err(SessionError::NoActiveStory)
    ));
}

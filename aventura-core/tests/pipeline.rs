//! Generation pipeline event flow with scripted collaborators.

use aventura_core::classifier::{ClassificationResult, NewCharacter};
use aventura_core::pipeline::{
    GenerationContext, GenerationPipeline, MemoryMode, Phase, PhaseResult, PipelineConfig,
    PipelineDependencies, PipelineEvent, StoryMode, UserActionInput,
};
use aventura_core::retrieval::{ActivationTracker, LoreSelector, RetrievalConfig, RetrievalError};
use aventura_core::story::{Chapter, EntityKind, InjectionMode, LoreEntry, LoreId, LoreType, StoryEntry, StoryId};
use aventura_core::translation::{TranslationError, Translator};
use async_trait::async_trait;
use aventura_core::testing::{
    collect_events, MockProvider, MockTurn, ScriptedChapterQuery, ScriptedClassifier, ScriptedSuggestions,
    ScriptedTranslator,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

fn deps(provider: Arc<MockProvider>, classifier: Arc<ScriptedClassifier>) -> PipelineDependencies {
    PipelineDependencies::new(
        provider,
        classifier,
        Arc::new(Mutex::new(ActivationTracker::default())),
    )
}

fn ctx(action: &str) -> GenerationContext {
    GenerationContext::new(StoryId::new(), UserActionInput::new(action))
        .with_entries(vec![
            StoryEntry::user_action("I wake up"),
            StoryEntry::narration("Rain drums on the roof of the inn."),
        ])
        .with_lore(vec![LoreEntry::new(LoreType::Location, "Inn", "The Drowned Rat, a smugglers' inn.")
            .with_keywords(["inn"])])
}

fn phase_starts(events: &[PipelineEvent]) -> Vec<Phase> {
    events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::PhaseStart { phase } => Some(*phase),
            _ => None,
        })
        .collect()
}

fn completed(events: &[PipelineEvent]) -> Vec<Phase> {
    events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::PhaseComplete { result } => Some(result.phase()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_phases_run_in_order() {
    let provider = Arc::new(MockProvider::new().with_turn(MockTurn::chunks(["The door ", "creaks open."])));
    let classifier = Arc::new(ScriptedClassifier::default());
    let pipeline = GenerationPipeline::new(PipelineConfig::default(), deps(provider, classifier));

    let events = collect_events(pipeline.execute(ctx("I leave the inn"), CancellationToken::new())).await;

    let expected = [
        Phase::PreGeneration,
        Phase::Narrative,
        Phase::Classification,
        Phase::PostGeneration,
    ];
    assert_eq!(phase_starts(&events), expected);
    assert_eq!(completed(&events), expected);

    // Each phase completes before the next one starts.
    let mut open: Option<Phase> = None;
    for event in &events {
        match event {
            PipelineEvent::PhaseStart { phase } => {
                assert!(open.is_none(), "{phase} started while another phase was open");
                open = Some(*phase);
            }
            PipelineEvent::PhaseComplete { result } => {
                assert_eq!(open.take(), Some(result.phase()));
            }
            _ => {}
        }
    }

    let classification_at = events
        .iter()
        .position(|e| matches!(e, PipelineEvent::ClassificationComplete { .. }))
        .unwrap();
    let classification_done = events
        .iter()
        .position(|e| matches!(e, PipelineEvent::PhaseComplete { result: PhaseResult::Classification }))
        .unwrap();
    assert!(classification_at < classification_done);
}

#[tokio::test]
async fn test_chunks_and_narrative_payload() {
    let provider = Arc::new(
        MockProvider::new().with_turn(MockTurn::chunks(["The door ", "creaks open."]).with_reasoning("Keep it tense.")),
    );
    let pipeline = GenerationPipeline::new(
        PipelineConfig::default(),
        deps(provider.clone(), Arc::new(ScriptedClassifier::default())),
    );

    let events = collect_events(pipeline.execute(ctx("I open the door"), CancellationToken::new())).await;

    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::NarrativeChunk { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "The door creaks open.");

    let narrative = events.iter().find_map(|e| match e {
        PipelineEvent::PhaseComplete {
            result: PhaseResult::Narrative { content, reasoning },
        } => Some((content.clone(), reasoning.clone())),
        _ => None,
    });
    assert_eq!(
        narrative,
        Some(("The door creaks open.".to_string(), "Keep it tense.".to_string()))
    );

    // Keyword lore reaches the narrator's system prompt.
    let request = &provider.requests()[0];
    assert!(request.system.as_deref().unwrap_or("").contains("The Drowned Rat"));
}

#[tokio::test]
async fn test_cancel_mid_stream_aborts() {
    let provider = Arc::new(MockProvider::new().with_turn(MockTurn::chunks(["The door ", "creaks"]).then_stall()));
    let classifier = Arc::new(ScriptedClassifier::default());
    let pipeline = GenerationPipeline::new(PipelineConfig::default(), deps(provider, classifier.clone()));
    let cancel = CancellationToken::new();

    let mut stream = pipeline.execute(ctx("I open the door"), cancel.clone());
    let mut events = Vec::new();
    let mut narration = String::new();
    while let Some(event) = stream.next().await {
        if let PipelineEvent::NarrativeChunk { content, .. } = &event {
            narration.push_str(content);
            if narration == "The door creaks" {
                cancel.cancel();
            }
        }
        events.push(event);
    }

    assert_eq!(narration, "The door creaks");
    assert_eq!(
        events.last(),
        Some(&PipelineEvent::Aborted {
            phase: Phase::Narrative
        })
    );
    assert!(!phase_starts(&events).contains(&Phase::Classification));
    assert_eq!(classifier.calls(), 0);
    assert!(!events.iter().any(|e| matches!(e, PipelineEvent::Error { .. })));
}

#[tokio::test]
async fn test_cancel_before_start() {
    let provider = Arc::new(MockProvider::new());
    let pipeline = GenerationPipeline::new(
        PipelineConfig::default(),
        deps(provider.clone(), Arc::new(ScriptedClassifier::default())),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let events = collect_events(pipeline.execute(ctx("I wait"), cancel)).await;

    assert_eq!(
        events,
        vec![PipelineEvent::Aborted {
            phase: Phase::PreGeneration
        }]
    );
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn test_classifier_failure_is_fatal() {
    let provider = Arc::new(MockProvider::new().with_turn(MockTurn::text("The guard squints at you.")));
    let pipeline = GenerationPipeline::new(
        PipelineConfig::default(),
        deps(provider, Arc::new(ScriptedClassifier::failing("invalid JSON"))),
    );
    let action = UserActionInput::new("I bluff");
    let entry_id = action.entry_id;
    let context = GenerationContext::new(StoryId::new(), action);

    let events = collect_events(pipeline.execute(context, CancellationToken::new())).await;

    match events.last() {
        Some(PipelineEvent::Error {
            fatal: true,
            phase: Phase::Classification,
            retry_entry_id,
            message,
        }) => {
            assert_eq!(*retry_entry_id, Some(entry_id));
            assert!(message.contains("invalid JSON"));
        }
        other => panic!("expected fatal classification error, got {other:?}"),
    }
    assert!(!phase_starts(&events).contains(&Phase::PostGeneration));
}

#[tokio::test]
async fn test_empty_narrative_is_fatal() {
    let provider = Arc::new(MockProvider::new().with_turn(MockTurn::text("   ")));
    let classifier = Arc::new(ScriptedClassifier::default());
    let pipeline = GenerationPipeline::new(PipelineConfig::default(), deps(provider, classifier.clone()));

    let events = collect_events(pipeline.execute(ctx("I wait"), CancellationToken::new())).await;

    assert!(matches!(
        events.last(),
        Some(PipelineEvent::Error {
            fatal: true,
            phase: Phase::Narrative,
            ..
        })
    ));
    assert_eq!(classifier.calls(), 0);
}

#[tokio::test]
async fn test_stream_failure_without_content_is_fatal() {
    let provider = Arc::new(MockProvider::new().with_turn(MockTurn::chunks(Vec::<String>::new()).then_fail("reset")));
    let pipeline = GenerationPipeline::new(
        PipelineConfig::default(),
        deps(provider, Arc::new(ScriptedClassifier::default())),
    );

    let events = collect_events(pipeline.execute(ctx("I wait"), CancellationToken::new())).await;
    assert!(matches!(events.last(), Some(PipelineEvent::Error { fatal: true, .. })));
}

#[tokio::test]
async fn test_partial_stream_failure_keeps_content() {
    let provider = Arc::new(MockProvider::new().with_turn(MockTurn::chunks(["The bridge sways"]).then_fail("reset")));
    let classifier = Arc::new(ScriptedClassifier::default());
    let pipeline = GenerationPipeline::new(PipelineConfig::default(), deps(provider, classifier.clone()));

    let events = collect_events(pipeline.execute(ctx("I cross"), CancellationToken::new())).await;

    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::Error {
            fatal: false,
            phase: Phase::Narrative,
            ..
        }
    )));
    assert_eq!(classifier.calls(), 1);
    assert!(completed(&events).contains(&Phase::PostGeneration));
}

#[tokio::test]
async fn test_post_generation_follows_mode() {
    let generator = Arc::new(
        ScriptedSuggestions::new()
            .with_suggestion("A stranger arrives")
            .with_choice("Draw your sword"),
    );

    for (mode, expect_suggestions) in [(StoryMode::Adventure, false), (StoryMode::CreativeWriting, true)] {
        let provider = Arc::new(MockProvider::new().with_turn(MockTurn::text("Night falls.")));
        let deps = deps(provider, Arc::new(ScriptedClassifier::default()))
            .with_suggestions(generator.clone())
            .with_action_choices(generator.clone());
        let pipeline = GenerationPipeline::new(PipelineConfig::default().with_mode(mode), deps);

        let events = collect_events(pipeline.execute(ctx("I rest"), CancellationToken::new())).await;
        let output = events
            .iter()
            .find_map(|e| match e {
                PipelineEvent::PhaseComplete {
                    result: PhaseResult::PostGeneration(output),
                } => Some(output.clone()),
                _ => None,
            })
            .unwrap();

        assert_eq!(output.suggestions.is_some(), expect_suggestions);
        assert_eq!(output.action_choices.is_some(), !expect_suggestions);
    }
}

#[tokio::test]
async fn test_post_generation_failure_is_not_fatal() {
    let provider = Arc::new(MockProvider::new().with_turn(MockTurn::text("Night falls.")));
    let deps = deps(provider, Arc::new(ScriptedClassifier::default()))
        .with_action_choices(Arc::new(ScriptedSuggestions::new()));
    let pipeline = GenerationPipeline::new(PipelineConfig::default(), deps);

    let events = collect_events(pipeline.execute(ctx("I rest"), CancellationToken::new())).await;

    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::Error {
            fatal: false,
            phase: Phase::PostGeneration,
            ..
        }
    )));
    assert_eq!(completed(&events).last(), Some(&Phase::PostGeneration));
}

#[tokio::test]
async fn test_translation_covers_narrative_and_new_entities() {
    let provider = Arc::new(MockProvider::new().with_turn(MockTurn::text("Old Tom waves.")));
    let classification = ClassificationResult {
        new_characters: vec![NewCharacter {
            name: "Old Tom".to_string(),
            description: "A ferryman".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };
    let deps = deps(provider, Arc::new(ScriptedClassifier::new(classification)))
        .with_translator(Arc::new(ScriptedTranslator::new()));
    let pipeline = GenerationPipeline::new(PipelineConfig::default().with_translation("es"), deps);

    let events = collect_events(pipeline.execute(ctx("I wave"), CancellationToken::new())).await;

    assert!(phase_starts(&events).contains(&Phase::Translation));
    let outcome = events
        .iter()
        .find_map(|e| match e {
            PipelineEvent::PhaseComplete {
                result: PhaseResult::Translation(outcome),
            } => Some(outcome.clone()),
            _ => None,
        })
        .unwrap();

    assert_eq!(outcome.narrative.as_deref(), Some("[es] Old Tom waves."));
    assert_eq!(outcome.entities.len(), 1);
    assert_eq!(outcome.entities[0].kind, EntityKind::Character);
    assert_eq!(outcome.entities[0].original_name, "Old Tom");
    assert_eq!(outcome.entities[0].name, "[es] Old Tom");
    assert_eq!(outcome.entities[0].description.as_deref(), Some("[es] A ferryman"));
}

#[tokio::test]
async fn test_translation_failure_keeps_originals() {
    let provider = Arc::new(MockProvider::new().with_turn(MockTurn::text("Night falls.")));
    let deps = deps(provider, Arc::new(ScriptedClassifier::default()))
        .with_translator(Arc::new(ScriptedTranslator::failing()));
    let pipeline = GenerationPipeline::new(PipelineConfig::default().with_translation("es"), deps);

    let events = collect_events(pipeline.execute(ctx("I rest"), CancellationToken::new())).await;

    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::Error {
            fatal: false,
            phase: Phase::Translation,
            ..
        }
    )));
    assert!(completed(&events).contains(&Phase::Translation));
    assert!(completed(&events).contains(&Phase::PostGeneration));
}

#[tokio::test]
async fn test_agentic_memory_feeds_narrator() {
    let provider = Arc::new(
        MockProvider::new()
            .with_turn(MockTurn::tool_call(
                "query_chapter",
                serde_json::json!({"chapter_number": 1, "question": "Who owes the captain?"}),
            ))
            .with_turn(MockTurn::tool_call(
                "finish_retrieval",
                serde_json::json!({"summary": "Mara owes the captain forty crowns (chapter 1)."}),
            ))
            .with_turn(MockTurn::text("The captain eyes Mara.")),
    );
    let queries = Arc::new(ScriptedChapterQuery::new("Mara owes him forty crowns."));
    let deps = deps(provider.clone(), Arc::new(ScriptedClassifier::default())).with_chapter_query(queries.clone());
    let config = PipelineConfig::default().with_memory_mode(MemoryMode::Agentic);
    let pipeline = GenerationPipeline::new(config, deps);

    let chapters = vec![
        Chapter::new(1, "Debts", "Mara borrows money."),
        Chapter::new(2, "Storm", "The ship is damaged."),
        Chapter::new(3, "Port", "They reach the harbor."),
    ];
    let context = ctx("I greet the captain").with_chapters(chapters);

    let events = collect_events(pipeline.execute(context, CancellationToken::new())).await;

    let pre = events
        .iter()
        .find_map(|e| match e {
            PipelineEvent::PhaseComplete {
                result: PhaseResult::PreGeneration(output),
            } => Some(output.clone()),
            _ => None,
        })
        .unwrap();
    let agentic = pre.agentic.unwrap();
    assert_eq!(agentic.queried_chapters, vec![1]);
    assert_eq!(queries.calls().len(), 1);

    let narrator = &provider.requests()[2];
    assert!(narrator.system.as_deref().unwrap_or("").contains("forty crowns"));
}

#[tokio::test]
async fn test_dropped_consumer_stops_producer() {
    let provider = Arc::new(MockProvider::new().with_turn(MockTurn::chunks(["a", "b", "c", "d"])));
    let classifier = Arc::new(ScriptedClassifier::default());
    let config = PipelineConfig::default().with_event_buffer(1);
    let pipeline = GenerationPipeline::new(config, deps(provider, classifier.clone()));

    let mut stream = pipeline.execute(ctx("I run"), CancellationToken::new());
    let first = stream.next().await;
    assert!(matches!(first, Some(PipelineEvent::PhaseStart { .. })));
    drop(stream);

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(classifier.calls(), 0);
}

/// Returns one text fewer than it was given.
struct ShortBatchTranslator;

#[async_trait]
impl Translator for ShortBatchTranslator {
    async fn translate(&self, text: &str, target_language: &str) -> Result<String, TranslationError> {
        Ok(format!("[{target_language}] {text}"))
    }

    async fn translate_batch(
        &self,
        texts: &[String],
        target_language: &str,
    ) -> Result<Vec<String>, TranslationError> {
        Ok(texts
            .iter()
            .skip(1)
            .map(|text| format!("[{target_language}] {text}"))
            .collect())
    }
}

#[tokio::test]
async fn test_short_world_translation_keeps_originals() {
    let provider = Arc::new(MockProvider::new().with_turn(MockTurn::text("Old Tom and Ida wave.")));
    let classification = ClassificationResult {
        new_characters: vec![
            NewCharacter {
                name: "Old Tom".to_string(),
                description: "A ferryman".to_string(),
                ..Default::default()
            },
            NewCharacter {
                name: "Ida".to_string(),
                description: "His daughter".to_string(),
                ..Default::default()
            },
        ],
        ..Default::default()
    };
    let deps = deps(provider, Arc::new(ScriptedClassifier::new(classification)))
        .with_translator(Arc::new(ShortBatchTranslator));
    let pipeline = GenerationPipeline::new(PipelineConfig::default().with_translation("es"), deps);

    let events = collect_events(pipeline.execute(ctx("I wave"), CancellationToken::new())).await;

    assert!(events.iter().any(|e| matches!(
        e,
        PipelineEvent::Error {
            fatal: false,
            phase: Phase::Translation,
            message,
            ..
        } if message.contains("Expected 4 translations, got 3")
    )));
    let outcome = events
        .iter()
        .find_map(|e| match e {
            PipelineEvent::PhaseComplete {
                result: PhaseResult::Translation(outcome),
            } => Some(outcome.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(outcome.narrative.as_deref(), Some("[es] Old Tom and Ida wave."));
    assert!(outcome.entities.is_empty());
}

/// While selecting, hands the activation tracker to a task that holds it,
/// cancels the turn and clears the tracker, the way a stop's restore does.
struct StopDuringSelection {
    activation: Arc<Mutex<ActivationTracker>>,
    cancel: CancellationToken,
}

#[async_trait]
impl LoreSelector for StopDuringSelection {
    async fn select(
        &self,
        _user_input: &str,
        _recent_text: &str,
        _candidates: &[LoreEntry],
        _limit: usize,
    ) -> Result<Vec<LoreId>, RetrievalError> {
        let (locked_tx, locked_rx) = oneshot::channel();
        let activation = Arc::clone(&self.activation);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut tracker = activation.lock().await;
            let _ = locked_tx.send(());
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
            tracker.clear();
        });
        let _ = locked_rx.await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_stop_while_selecting_keeps_restored_activation() {
    let provider = Arc::new(MockProvider::new().with_turn(MockTurn::text("unused")));
    let activation = Arc::new(Mutex::new(ActivationTracker::default()));
    let cancel = CancellationToken::new();
    let selector = StopDuringSelection {
        activation: Arc::clone(&activation),
        cancel: cancel.clone(),
    };
    let deps = PipelineDependencies::new(provider, Arc::new(ScriptedClassifier::default()), Arc::clone(&activation))
        .with_lore_selector(Arc::new(selector));
    let config = PipelineConfig::default().with_retrieval(RetrievalConfig::default().with_llm_tier(true));
    let pipeline = GenerationPipeline::new(config, deps);
    let context = ctx("I enter the inn").with_lore(vec![
        LoreEntry::new(LoreType::Location, "Inn", "The Drowned Rat.").with_keywords(["inn"]),
        LoreEntry::new(LoreType::Faction, "Crown", "The ruling house.").with_injection(InjectionMode::Relevant),
    ]);

    let events = collect_events(pipeline.execute(context, cancel)).await;

    assert!(events.iter().any(|e| matches!(e, PipelineEvent::Aborted { .. })));
    assert!(activation.lock().await.is_empty());
}

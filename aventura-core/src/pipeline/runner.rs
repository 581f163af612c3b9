//! The generation pipeline: five phases behind one cancellable event stream.
//!
//! [`GenerationPipeline::execute`] spawns a producer task that runs the phases in
//! order and pushes [`PipelineEvent`]s into a bounded channel. The caller drains
//! the returned stream. Cancelling the token stops the turn with an `aborted`
//! event; dropping the stream stops the producer at its next send.

use super::config::{MemoryMode, PipelineConfig, StoryMode};
use super::context::{narrative_request, GenerationContext, PipelineDependencies, PromptContext};
use super::events::{
    Phase, PhaseResult, PipelineEvent, PostGenerationOutput, PreGenerationOutput,
    TranslatedEntity, TranslationOutcome,
};
use crate::agentic::{AgenticContext, AgenticRetrieval, Termination};
use crate::classifier::ClassificationResult;
use crate::retrieval::{RetrievalRequest, TieredRetrieval};
use crate::story::{transcript, EntityKind};
use crate::translation::TranslationError;
use claude::StreamChunk;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// The consumer side of a running pipeline.
pub type PipelineStream = ReceiverStream<PipelineEvent>;

/// The consumer went away; stop producing.
struct Closed;

/// Why a phase ended the turn early.
enum Stop {
    /// `aborted` or a fatal error was emitted.
    Ended,
    Closed,
}

impl From<Closed> for Stop {
    fn from(_: Closed) -> Self {
        Stop::Closed
    }
}

type PhaseOutcome<T> = Result<T, Stop>;

/// Runs turns. Cheap to clone; each `execute` call is an independent turn.
#[derive(Clone)]
pub struct GenerationPipeline {
    config: Arc<PipelineConfig>,
    deps: PipelineDependencies,
}

impl GenerationPipeline {
    pub fn new(config: PipelineConfig, deps: PipelineDependencies) -> Self {
        Self {
            config: Arc::new(config),
            deps,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn dependencies(&self) -> &PipelineDependencies {
        &self.deps
    }

    /// Start a turn. Events arrive on the returned stream; it ends after the
    /// post-generation phase, after `aborted`, or after a fatal error.
    pub fn execute(&self, ctx: GenerationContext, cancel: CancellationToken) -> PipelineStream {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        let span = tracing::info_span!(
            "pipeline",
            story = %ctx.story_id,
            entry = %ctx.user_action.entry_id
        );

        let turn = Turn {
            config: Arc::clone(&self.config),
            deps: self.deps.clone(),
            ctx,
            cancel,
            tx,
        };
        tokio::spawn(turn.run().instrument(span));

        ReceiverStream::new(rx)
    }
}

/// One turn's producer.
struct Turn {
    config: Arc<PipelineConfig>,
    deps: PipelineDependencies,
    ctx: GenerationContext,
    cancel: CancellationToken,
    tx: mpsc::Sender<PipelineEvent>,
}

impl Turn {
    async fn run(self) {
        match self.phases().await {
            Ok(()) => info!("Turn complete"),
            Err(Stop::Ended) => debug!("Turn ended early"),
            Err(Stop::Closed) => debug!("Event consumer dropped, producer stopped"),
        }
    }

    async fn phases(&self) -> PhaseOutcome<()> {
        let pre = self.pre_generation().await?;
        let narrative = self.narrative(&pre).await?;
        let classification = self.classification(&narrative).await?;
        if self.config.translation.enabled && self.deps.translator.is_some() {
            self.translation(&narrative, &classification).await?;
        }
        self.post_generation(&narrative).await
    }

    // ------------------------------------------------------------------------
    // Event plumbing
    // ------------------------------------------------------------------------

    async fn emit(&self, event: PipelineEvent) -> Result<(), Closed> {
        self.tx.send(event).await.map_err(|_| Closed)
    }

    async fn start_phase(&self, phase: Phase) -> PhaseOutcome<()> {
        if self.cancel.is_cancelled() {
            return self.abort(phase).await;
        }
        debug!(%phase, "Phase start");
        self.emit(PipelineEvent::PhaseStart { phase }).await?;
        Ok(())
    }

    async fn complete_phase(&self, result: PhaseResult) -> PhaseOutcome<()> {
        debug!(phase = %result.phase(), "Phase complete");
        self.emit(PipelineEvent::PhaseComplete { result }).await?;
        Ok(())
    }

    async fn abort<T>(&self, phase: Phase) -> PhaseOutcome<T> {
        info!(%phase, "Turn aborted");
        self.emit(PipelineEvent::Aborted { phase }).await?;
        Err(Stop::Ended)
    }

    async fn fail<T>(&self, phase: Phase, message: String) -> PhaseOutcome<T> {
        warn!(%phase, %message, "Fatal pipeline error");
        self.emit(PipelineEvent::Error {
            fatal: true,
            message,
            phase,
            retry_entry_id: Some(self.ctx.user_action.entry_id),
        })
        .await?;
        Err(Stop::Ended)
    }

    async fn degrade(&self, phase: Phase, message: String) -> Result<(), Closed> {
        warn!(%phase, %message, "Non-fatal pipeline error");
        self.emit(PipelineEvent::Error {
            fatal: false,
            message,
            phase,
            retry_entry_id: None,
        })
        .await
    }

    /// Await `future` unless the turn is cancelled or the consumer leaves first.
    async fn guarded<F: Future>(&self, phase: Phase, future: F) -> PhaseOutcome<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => self.abort(phase).await,
            _ = self.tx.closed() => Err(Stop::Closed),
            output = future => Ok(output),
        }
    }

    fn recent_text(&self, window: usize) -> String {
        transcript(&self.ctx.entries, window)
    }

    // ------------------------------------------------------------------------
    // Phase 1: pre-generation
    // ------------------------------------------------------------------------

    async fn pre_generation(&self) -> PhaseOutcome<PreGenerationOutput> {
        let phase = Phase::PreGeneration;
        self.start_phase(phase).await?;

        let ctx = &self.ctx;
        let memory = &self.config.memory;
        let chapter_count = ctx.chapters.len();
        let mut output = PreGenerationOutput::default();

        let use_agentic = memory.mode == MemoryMode::Agentic && chapter_count >= memory.agentic_min_chapters;
        let use_timeline = match memory.mode {
            MemoryMode::Off => false,
            MemoryMode::TimelineFill => true,
            MemoryMode::Agentic => !use_agentic,
        };

        if let Some(queries) = self.deps.chapter_query.as_deref().filter(|_| chapter_count > 0) {
            if use_agentic {
                let agent = AgenticRetrieval::new(Arc::clone(&self.deps.provider), self.config.agentic.clone());
                let agentic_ctx = AgenticContext {
                    user_input: &ctx.user_action.content,
                    recent_entries: &ctx.entries,
                    chapters: &ctx.chapters,
                    entries: &ctx.lore,
                };
                let result = agent.run_retrieval(&agentic_ctx, queries, &self.cancel).await;
                if result.terminated_by == Termination::ProviderError {
                    self.degrade(phase, "Agentic retrieval failed; using what was found".to_string())
                        .await?;
                }
                output.agentic = Some(result);
            } else if let Some(timeline) = self.deps.timeline.as_deref().filter(|_| use_timeline) {
                let recent = self.recent_text(self.config.narrative.recent_entry_window);
                match timeline
                    .fill(&ctx.user_action.content, &recent, &ctx.chapters, queries, &self.cancel)
                    .await
                {
                    Ok(context) if !context.trim().is_empty() => output.timeline_context = Some(context),
                    Ok(_) => {}
                    Err(e) => self.degrade(phase, format!("Timeline fill failed: {e}")).await?,
                }
            }
        }

        // Retrieval runs against a copy; the story's tracker only changes if the
        // turn is still live afterwards.
        let mut tracker = self.deps.activation.lock().await.clone();
        let mut retrieval = TieredRetrieval::new(self.config.retrieval.clone());
        if let Some(selector) = &self.deps.lore_selector {
            retrieval = retrieval.with_selector(Arc::clone(selector));
        }
        let request = RetrievalRequest::new(&ctx.user_action.content, &ctx.entries, ctx.story_position())
            .with_world(&ctx.world);
        output.retrieval = retrieval
            .select_context(&ctx.lore, &request, Some(&mut tracker), &self.cancel)
            .await;

        if let Some(error) = &output.retrieval.tier3_error {
            self.degrade(phase, format!("Lore selection failed: {error}")).await?;
        }
        // Checked under the lock so a stop's restore cannot land in between.
        let mut shared = self.deps.activation.lock().await;
        if !self.cancel.is_cancelled() {
            *shared = tracker;
        }
        drop(shared);

        info!(
            lore = output.retrieval.all.len(),
            agentic = output.agentic.is_some(),
            timeline = output.timeline_context.is_some(),
            "Context assembled"
        );
        self.complete_phase(PhaseResult::PreGeneration(output.clone())).await?;
        Ok(output)
    }

    fn history_context<'a>(&self, output: &'a PreGenerationOutput) -> Option<&'a str> {
        output
            .agentic
            .as_ref()
            .map(|a| a.context.as_str())
            .or(output.timeline_context.as_deref())
    }

    // ------------------------------------------------------------------------
    // Phase 2: narrative streaming
    // ------------------------------------------------------------------------

    async fn narrative(&self, pre: &PreGenerationOutput) -> PhaseOutcome<String> {
        let phase = Phase::Narrative;
        self.start_phase(phase).await?;

        let extra = PromptContext {
            lore: Some(&pre.retrieval),
            history: self.history_context(pre),
        };
        let request = narrative_request(&self.config, &self.ctx, &extra);

        let opened = self
            .guarded(phase, self.deps.provider.stream_with_tools(request))
            .await?;
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return self.fail(phase, format!("Narrative request failed: {e}")).await,
        };

        let mut content = String::new();
        let mut reasoning = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.abort(phase).await,
                next = stream.next() => next,
            };

            match next {
                None | Some(Ok(StreamChunk::Done { .. })) => break,
                Some(Ok(StreamChunk::Content { text })) => {
                    content.push_str(&text);
                    self.emit(PipelineEvent::NarrativeChunk {
                        content: text,
                        reasoning: String::new(),
                    })
                    .await?;
                }
                Some(Ok(StreamChunk::Reasoning { text })) => {
                    reasoning.push_str(&text);
                    self.emit(PipelineEvent::NarrativeChunk {
                        content: String::new(),
                        reasoning: text,
                    })
                    .await?;
                }
                Some(Ok(other)) => debug!(chunk = ?other, "Ignoring tool chunk in narrative stream"),
                Some(Err(e)) if content.is_empty() => {
                    return self.fail(phase, format!("Narrative stream failed: {e}")).await;
                }
                Some(Err(e)) => {
                    self.degrade(phase, format!("Narrative stream interrupted: {e}")).await?;
                    break;
                }
            }
        }

        if content.trim().is_empty() {
            return self.fail(phase, "The model returned an empty response".to_string()).await;
        }

        info!(chars = content.len(), "Narrative streamed");
        self.complete_phase(PhaseResult::Narrative {
            content: content.clone(),
            reasoning,
        })
        .await?;
        Ok(content)
    }

    // ------------------------------------------------------------------------
    // Phase 3: classification
    // ------------------------------------------------------------------------

    async fn classification(&self, narrative: &str) -> PhaseOutcome<ClassificationResult> {
        let phase = Phase::Classification;
        self.start_phase(phase).await?;

        let classified = self
            .guarded(
                phase,
                self.deps
                    .classifier
                    .classify(narrative, &self.ctx.user_action.content, &self.ctx.world),
            )
            .await?;

        let result = match classified {
            Ok(result) => result,
            Err(e) => return self.fail(phase, e.to_string()).await,
        };

        info!(
            new_entities = result.new_entity_count(),
            location = ?result.scene.current_location,
            "Classified narrative"
        );
        self.emit(PipelineEvent::ClassificationComplete {
            result: result.clone(),
        })
        .await?;
        self.complete_phase(PhaseResult::Classification).await?;
        Ok(result)
    }

    // ------------------------------------------------------------------------
    // Phase 4: translation
    // ------------------------------------------------------------------------

    async fn translation(&self, narrative: &str, classification: &ClassificationResult) -> PhaseOutcome<()> {
        let phase = Phase::Translation;
        self.start_phase(phase).await?;

        let Some(translator) = self.deps.translator.as_deref() else {
            return self.complete_phase(PhaseResult::Translation(TranslationOutcome::default())).await;
        };
        let settings = &self.config.translation;
        let language = settings.target_language.as_str();
        let mut outcome = TranslationOutcome::default();

        if settings.translate_narrative {
            match self.guarded(phase, translator.translate(narrative, language)).await? {
                Ok(text) if !text.trim().is_empty() => outcome.narrative = Some(text),
                Ok(_) => {}
                Err(e) => self.degrade(phase, format!("Narrative translation failed: {e}")).await?,
            }
        }

        let created = new_entities(classification);
        if settings.translate_world && !created.is_empty() {
            let texts: Vec<String> = created
                .iter()
                .flat_map(|(_, name, description)| [name.clone(), description.clone()])
                .collect();
            match self.guarded(phase, translator.translate_batch(&texts, language)).await? {
                Ok(translated) if translated.len() != texts.len() => {
                    let e = TranslationError::Mismatch {
                        expected: texts.len(),
                        got: translated.len(),
                    };
                    self.degrade(phase, format!("World translation failed: {e}")).await?;
                }
                Ok(translated) => {
                    outcome.entities = created
                        .iter()
                        .zip(translated.chunks(2))
                        .map(|((kind, original, description), pair)| TranslatedEntity {
                            kind: *kind,
                            original_name: original.clone(),
                            name: pair.first().cloned().unwrap_or_else(|| original.clone()),
                            description: pair.get(1).filter(|_| !description.is_empty()).cloned(),
                        })
                        .collect();
                }
                Err(e) => self.degrade(phase, format!("World translation failed: {e}")).await?,
            }
        }

        self.complete_phase(PhaseResult::Translation(outcome)).await
    }

    // ------------------------------------------------------------------------
    // Phase 5: post-generation
    // ------------------------------------------------------------------------

    async fn post_generation(&self, narrative: &str) -> PhaseOutcome<()> {
        let phase = Phase::PostGeneration;
        self.start_phase(phase).await?;

        let recent = self.recent_text(self.config.post.recent_window);
        let post = &self.config.post;
        let mode = self.config.mode;

        let suggestions_branch = async {
            let generator = self
                .deps
                .suggestions
                .as_deref()
                .filter(|_| post.suggestions && mode == StoryMode::CreativeWriting)?;
            let mut errors = Vec::new();
            let suggestions = match generator.suggestions(narrative, &recent).await {
                Ok(mut suggestions) => {
                    let texts: Vec<String> = suggestions.iter().map(|s| s.text.clone()).collect();
                    match self.translate_post(&texts).await {
                        Some(Ok(translated)) => {
                            for (suggestion, text) in suggestions.iter_mut().zip(translated) {
                                suggestion.text = text;
                            }
                        }
                        Some(Err(e)) => errors.push(format!("Suggestion translation failed: {e}")),
                        None => {}
                    }
                    Some(suggestions)
                }
                Err(e) => {
                    errors.push(format!("Suggestions failed: {e}"));
                    None
                }
            };
            Some((suggestions, errors))
        };

        let choices_branch = async {
            let generator = self
                .deps
                .action_choices
                .as_deref()
                .filter(|_| post.action_choices && mode == StoryMode::Adventure)?;
            let mut errors = Vec::new();
            let choices = match generator.action_choices(narrative, &recent).await {
                Ok(mut choices) => {
                    let texts: Vec<String> = choices.iter().map(|c| c.text.clone()).collect();
                    match self.translate_post(&texts).await {
                        Some(Ok(translated)) => {
                            for (choice, text) in choices.iter_mut().zip(translated) {
                                choice.text = text;
                            }
                        }
                        Some(Err(e)) => errors.push(format!("Action choice translation failed: {e}")),
                        None => {}
                    }
                    Some(choices)
                }
                Err(e) => {
                    errors.push(format!("Action choices failed: {e}"));
                    None
                }
            };
            Some((choices, errors))
        };

        let (suggestions, choices) = self
            .guarded(phase, futures::future::join(suggestions_branch, choices_branch))
            .await?;

        let mut output = PostGenerationOutput::default();
        if let Some((suggestions, errors)) = suggestions {
            output.suggestions = suggestions;
            for error in errors {
                self.degrade(phase, error).await?;
            }
        }
        if let Some((choices, errors)) = choices {
            output.action_choices = choices;
            for error in errors {
                self.degrade(phase, error).await?;
            }
        }

        self.complete_phase(PhaseResult::PostGeneration(output)).await
    }

    /// Translate post-generation texts when configured. `None` when skipped.
    async fn translate_post(
        &self,
        texts: &[String],
    ) -> Option<Result<Vec<String>, TranslationError>> {
        let settings = &self.config.translation;
        let translator = self
            .deps
            .translator
            .as_deref()
            .filter(|_| settings.enabled && settings.translate_post && !texts.is_empty())?;
        Some(translator.translate_batch(texts, &settings.target_language).await)
    }
}

/// (kind, name, description) of every entity the classification proposes to create.
fn new_entities(result: &ClassificationResult) -> Vec<(EntityKind, String, String)> {
    let characters = result
        .new_characters
        .iter()
        .map(|c| (EntityKind::Character, c.name.clone(), c.description.clone()));
    let locations = result
        .new_locations
        .iter()
        .map(|l| (EntityKind::Location, l.name.clone(), l.description.clone()));
    let items = result
        .new_items
        .iter()
        .map(|i| (EntityKind::Item, i.name.clone(), i.description.clone()));
    let beats = result
        .new_story_beats
        .iter()
        .map(|b| (EntityKind::StoryBeat, b.title.clone(), b.description.clone()));

    characters.chain(locations).chain(items).chain(beats).collect()
}

//! StorySession - the turn driver between a UI and the generation pipeline.
//!
//! A session owns the story's rollback slot and turn gate. Each submitted action
//! is backed up, run through the pipeline, and committed to the store as events
//! arrive: entries and the world delta on `classification_complete`, translations
//! on the translation phase, a system entry on fatal errors. Stop and retry undo
//! the turn through the [`RollbackManager`].

use crate::classifier::ClassificationResult;
use crate::pipeline::{
    GenerationContext, GenerationPipeline, PhaseResult, PipelineEvent, TranslationOutcome,
    UserActionInput,
};
use crate::rollback::{ActionType, RetryBackup, RollbackManager, StopOutcome, TurnGate, TurnTicket};
use crate::store::{StoreError, StoryStore, UiOps};
use crate::story::{EntryId, StoryEntry, StoryId, TimeProgression, WorldChanges};
use crate::suggestions::{ActionChoice, Suggestion};
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors from StorySession operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No active story")]
    NoActiveStory,

    #[error("A generation is already running")]
    Busy,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// What the user submitted.
#[derive(Debug, Clone, PartialEq)]
pub struct UserAction {
    /// Exactly what was typed or picked.
    pub raw_input: String,
    pub action_type: ActionType,
    /// Whether the input is an unedited suggested action choice.
    pub was_raw_action_choice: bool,
}

impl UserAction {
    pub fn new(raw_input: impl Into<String>) -> Self {
        Self {
            raw_input: raw_input.into(),
            action_type: ActionType::Do,
            was_raw_action_choice: false,
        }
    }

    pub fn from_choice(choice: &ActionChoice) -> Self {
        Self {
            was_raw_action_choice: true,
            ..Self::new(&choice.text)
        }
    }

    pub fn with_action_type(mut self, action_type: ActionType) -> Self {
        self.action_type = action_type;
        self
    }

    /// The text sent to the narrator and stored as the user-action entry.
    pub fn content(&self) -> String {
        let raw = self.raw_input.trim();
        match self.action_type {
            ActionType::Say => format!("You say: \"{raw}\""),
            ActionType::Think => format!("You think: {raw}"),
            ActionType::Do | ActionType::Story | ActionType::Free => raw.to_string(),
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed,
    Aborted,
    /// A fatal error; the turn can be retried with `retry_failed_generation`.
    Failed { message: String },
    /// The turn was stopped, retried or switched away from while it ran.
    Superseded,
}

/// Result of one submitted action.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    pub user_action_entry_id: EntryId,
    pub narration_entry_id: Option<EntryId>,
    pub narrative: String,
    pub world_changes: Option<WorldChanges>,
    pub suggestions: Option<Vec<Suggestion>>,
    pub action_choices: Option<Vec<ActionChoice>>,
    /// Messages of non-fatal errors.
    pub warnings: Vec<String>,
}

impl TurnReport {
    fn new(user_action_entry_id: EntryId) -> Self {
        Self {
            outcome: TurnOutcome::Completed,
            user_action_entry_id,
            narration_entry_id: None,
            narrative: String::new(),
            world_changes: None,
            suggestions: None,
            action_choices: None,
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct FailedTurn {
    story: StoryId,
    action: UserAction,
    entry_id: EntryId,
    system_entry_id: EntryId,
}

/// Everything a running turn needs to commit its events.
struct Turn {
    story: StoryId,
    action: UserAction,
    ticket: TurnTicket,
    cancel: CancellationToken,
    reasoning: String,
    report: TurnReport,
}

pub struct StorySession {
    pipeline: GenerationPipeline,
    store: Arc<dyn StoryStore>,
    ui: Arc<dyn UiOps>,
    gate: Arc<TurnGate>,
    rollback: RollbackManager,
    in_flight: Mutex<Option<CancellationToken>>,
    failed: Mutex<Option<FailedTurn>>,
}

impl StorySession {
    pub fn new(pipeline: GenerationPipeline, store: Arc<dyn StoryStore>, ui: Arc<dyn UiOps>) -> Self {
        let gate = Arc::new(TurnGate::new());
        let activation = Arc::clone(&pipeline.dependencies().activation);
        Self {
            rollback: RollbackManager::new(Arc::clone(&gate), activation),
            pipeline,
            store,
            ui,
            gate,
            in_flight: Mutex::new(None),
            failed: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &GenerationPipeline {
        &self.pipeline
    }

    pub fn rollback(&self) -> &RollbackManager {
        &self.rollback
    }

    pub async fn has_failed_turn(&self) -> bool {
        self.failed.lock().await.is_some()
    }

    /// Run one turn for the active story.
    pub async fn submit_action(&self, action: UserAction) -> Result<TurnReport, SessionError> {
        if self.ui.is_generating() {
            return Err(SessionError::Busy);
        }
        self.run_turn(action, EntryId::new()).await
    }

    /// Cancel the running turn and undo everything it wrote.
    pub async fn stop_generation(&self) -> StopOutcome {
        if let Some(cancel) = self.in_flight.lock().await.take() {
            cancel.cancel();
        }
        self.rollback
            .handle_stop_generation(self.store.as_ref(), self.ui.as_ref())
            .await
    }

    /// Undo the last turn and submit its input again.
    ///
    /// Returns `None` while a generation is running or when there is nothing to retry.
    pub async fn retry_last_message(&self) -> Result<Option<TurnReport>, SessionError> {
        if self.ui.is_generating() {
            debug!("Retry ignored while generating");
            return Ok(None);
        }

        let outcome = self
            .rollback
            .handle_retry_last_message(self.store.as_ref(), self.ui.as_ref())
            .await;
        let Some(raw_input) = outcome.restored_raw_input.filter(|_| outcome.success) else {
            return Ok(None);
        };

        let action = UserAction {
            raw_input,
            action_type: outcome.restored_action_type.unwrap_or_default(),
            was_raw_action_choice: outcome.restored_was_raw_action_choice.unwrap_or(false),
        };
        let entry_id = outcome.restored_user_action_entry_id.unwrap_or_default();
        self.run_turn(action, entry_id).await.map(Some)
    }

    /// Re-run a turn that ended in a fatal error, reusing its user-action entry id.
    pub async fn retry_failed_generation(&self) -> Result<Option<TurnReport>, SessionError> {
        if self.ui.is_generating() {
            debug!("Retry ignored while generating");
            return Ok(None);
        }

        let Some(failed) = self.failed.lock().await.take() else {
            return Ok(None);
        };
        if self.ui.active_story() != Some(failed.story) {
            debug!(story = %failed.story, "Failed turn belongs to another story");
            return Ok(None);
        }

        // The backup still describes the story before the failed turn, so a
        // rollback also removes the system entry.
        let rolled_back = self.rollback.has_backup_for(failed.story).await
            && self
                .rollback
                .handle_retry_last_message(self.store.as_ref(), self.ui.as_ref())
                .await
                .success;
        if !rolled_back {
            match self.store.delete_entry(failed.story, failed.system_entry_id).await {
                Ok(()) | Err(StoreError::EntryNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(entry = %failed.entry_id, "Retrying failed generation");
        self.run_turn(failed.action, failed.entry_id).await.map(Some)
    }

    /// Make `story` the active story, abandoning any turn of the previous one.
    pub async fn switch_story(&self, story: StoryId) {
        if let Some(cancel) = self.in_flight.lock().await.take() {
            cancel.cancel();
        }
        self.gate.invalidate();

        if let Some(previous) = self.ui.active_story().filter(|&previous| previous != story) {
            self.rollback.invalidate_for_story(previous).await;
        }
        self.pipeline.dependencies().activation.lock().await.clear();
        *self.failed.lock().await = None;

        self.ui.set_active_story(story);
        self.ui.set_generating(false);
        self.ui.clear_transient();
        info!(%story, "Switched story");
    }

    // ------------------------------------------------------------------------
    // Turn driving
    // ------------------------------------------------------------------------

    async fn run_turn(&self, action: UserAction, entry_id: EntryId) -> Result<TurnReport, SessionError> {
        let story = self.ui.active_story().ok_or(SessionError::NoActiveStory)?;

        // Ticket and token exist before the first await so a stop always sees this turn.
        let ticket = self.gate.begin_turn();
        let cancel = CancellationToken::new();
        self.ui.clear_transient();
        self.ui.set_generating(true);
        *self.in_flight.lock().await = Some(cancel.clone());
        *self.failed.lock().await = None;

        let result = self.drive(story, action, entry_id, ticket, cancel).await;

        if self.gate.is_current(ticket) {
            self.ui.set_generating(false);
            *self.in_flight.lock().await = None;
        }
        result
    }

    #[tracing::instrument(skip_all, fields(story = %story, entry = %entry_id))]
    async fn drive(
        &self,
        story: StoryId,
        action: UserAction,
        entry_id: EntryId,
        ticket: TurnTicket,
        cancel: CancellationToken,
    ) -> Result<TurnReport, SessionError> {
        let (entries, world, time, lore, chapters) = {
            // Reads and the backup happen as one step relative to a stop's restore.
            let _reading = self.gate.lock().await;
            let entries = self.store.entries(story).await?;
            let world = self.store.world(story).await?;
            let time = self.store.time(story).await?;
            let lore = self.store.lore_entries(story).await?;
            let chapters = self.store.chapters(story).await?;

            if cancel.is_cancelled() || !self.gate.is_current(ticket) {
                debug!("Turn stopped before it backed up");
                return Ok(TurnReport {
                    outcome: TurnOutcome::Aborted,
                    ..TurnReport::new(entry_id)
                });
            }

            let activation = self.pipeline.dependencies().activation.lock().await.snapshot();
            let backup = RetryBackup::new(story, entries.clone(), time)
                .with_full_state(world.clone(), activation)
                .with_input(&action.raw_input, action.action_type)
                .with_raw_action_choice(action.was_raw_action_choice)
                .with_user_action_entry(entry_id);
            self.rollback.create_backup_for_turn(backup, ticket).await;
            (entries, world, time, lore, chapters)
        };

        let ctx = GenerationContext::new(story, UserActionInput::new(action.content()).with_entry_id(entry_id))
            .with_entries(entries)
            .with_lore(lore)
            .with_chapters(chapters)
            .with_world(world)
            .with_time(time);
        let mut events = self.pipeline.execute(ctx, cancel.clone());

        let mut turn = Turn {
            story,
            action,
            ticket,
            cancel,
            reasoning: String::new(),
            report: TurnReport::new(entry_id),
        };

        while let Some(event) = events.next().await {
            if !self.handle_event(&mut turn, event).await? {
                break;
            }
        }

        info!(outcome = ?turn.report.outcome, "Turn finished");
        Ok(turn.report)
    }

    /// Apply one event. Returns false once the turn should stop being driven.
    async fn handle_event(&self, turn: &mut Turn, event: PipelineEvent) -> Result<bool, SessionError> {
        match event {
            PipelineEvent::PhaseStart { phase } => {
                debug!(%phase, "Phase started");
            }
            PipelineEvent::NarrativeChunk { content, reasoning } => {
                turn.report.narrative.push_str(&content);
                turn.reasoning.push_str(&reasoning);
            }
            PipelineEvent::Aborted { phase } => {
                debug!(%phase, "Turn aborted");
                turn.report.outcome = TurnOutcome::Aborted;
                return Ok(false);
            }
            PipelineEvent::Error { fatal: false, message, .. } => {
                turn.report.warnings.push(message);
            }
            PipelineEvent::Error {
                fatal: true,
                message,
                retry_entry_id,
                ..
            } => {
                let _commit = self.gate.lock().await;
                if !self.still_current(turn) {
                    return Ok(false);
                }
                self.record_failure(turn, &message, retry_entry_id).await?;
                return Ok(false);
            }
            PipelineEvent::ClassificationComplete { result } => {
                let _commit = self.gate.lock().await;
                if !self.still_current(turn) {
                    return Ok(false);
                }
                self.commit_turn(turn, &result).await?;
            }
            PipelineEvent::PhaseComplete { result } => match result {
                PhaseResult::Narrative { content, reasoning } => {
                    turn.report.narrative = content;
                    turn.reasoning = reasoning;
                }
                PhaseResult::Translation(outcome) => {
                    let _commit = self.gate.lock().await;
                    if !self.still_current(turn) {
                        return Ok(false);
                    }
                    self.apply_translation(turn, outcome).await?;
                }
                PhaseResult::PostGeneration(output) => {
                    if !self.still_current(turn) {
                        return Ok(false);
                    }
                    turn.report.suggestions = output.suggestions;
                    turn.report.action_choices = output.action_choices;
                }
                PhaseResult::PreGeneration(_) | PhaseResult::Classification => {}
            },
        }
        Ok(true)
    }

    /// Whether the turn may still write. Marks the report when it may not.
    fn still_current(&self, turn: &mut Turn) -> bool {
        if self.gate.is_current(turn.ticket) {
            return true;
        }
        debug!("Dropping late event from a superseded turn");
        turn.report.outcome = if turn.cancel.is_cancelled() {
            TurnOutcome::Aborted
        } else {
            TurnOutcome::Superseded
        };
        false
    }

    async fn commit_turn(&self, turn: &mut Turn, result: &ClassificationResult) -> Result<(), SessionError> {
        let story = turn.story;
        let now = chrono::Utc::now().timestamp_millis();

        let user_entry = StoryEntry::user_action(turn.action.content()).with_id(turn.report.user_action_entry_id);
        self.store.add_entry(story, user_entry).await?;

        let narration = StoryEntry::narration(&turn.report.narrative).with_reasoning(turn.reasoning.as_str());
        turn.report.narration_entry_id = Some(narration.id);
        self.store.add_entry(story, narration).await?;

        let mut world = self.store.world(story).await?;
        let changes = world.apply_classification(result, now);
        self.store.replace_world(story, world).await?;

        let progression = result.scene.time_progression;
        if progression != TimeProgression::None {
            let mut time = self.store.time(story).await?;
            time.advance(progression);
            self.store.set_time(story, time).await?;
        }

        info!(
            created = changes.created.len(),
            updated = changes.updated.len(),
            location_changed = changes.location_changed,
            "Turn committed"
        );
        turn.report.world_changes = Some(changes);
        Ok(())
    }

    async fn apply_translation(&self, turn: &mut Turn, outcome: TranslationOutcome) -> Result<(), SessionError> {
        let story = turn.story;

        if let (Some(text), Some(id)) = (outcome.narrative, turn.report.narration_entry_id) {
            self.store.update_entry(story, id, text.clone()).await?;
            turn.report.narrative = text;
        }

        if !outcome.entities.is_empty() {
            let mut world = self.store.world(story).await?;
            for entity in &outcome.entities {
                let applied = world.apply_translation(
                    entity.kind,
                    &entity.original_name,
                    &entity.name,
                    entity.description.as_deref(),
                );
                if !applied {
                    warn!(name = %entity.original_name, "Translated entity not found");
                }
            }
            self.store.replace_world(story, world).await?;
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        turn: &mut Turn,
        message: &str,
        retry_entry_id: Option<EntryId>,
    ) -> Result<(), SessionError> {
        let system = StoryEntry::system(format!("Generation failed: {message}"));
        let system_entry_id = system.id;
        self.store.add_entry(turn.story, system).await?;

        *self.failed.lock().await = Some(FailedTurn {
            story: turn.story,
            action: turn.action.clone(),
            entry_id: retry_entry_id.unwrap_or(turn.report.user_action_entry_id),
            system_entry_id,
        });
        turn.report.outcome = TurnOutcome::Failed {
            message: message.to_string(),
        };
        Ok(())
    }
}

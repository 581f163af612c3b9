//! The story's backup slot and the stop/retry restore path.

use super::backup::{ActionType, RetryBackup};
use super::gate::{TurnGate, TurnTicket};
use crate::retrieval::ActivationTracker;
use crate::store::{StoreError, StoryStore, UiOps};
use crate::story::{EntryId, StoryId};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StopOutcome {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RetryOutcome {
    pub success: bool,
    pub restored_raw_input: Option<String>,
    pub restored_action_type: Option<ActionType>,
    pub restored_was_raw_action_choice: Option<bool>,
    /// The user-action entry the retried turn should reuse.
    pub restored_user_action_entry_id: Option<EntryId>,
}

/// A backup and the turn that took it, when known.
struct Held {
    backup: RetryBackup,
    owner: Option<TurnTicket>,
}

/// What a stop or retry did with the slot.
enum Rollback {
    Restored(RetryBackup),
    /// The turn being stopped had not backed up yet, so it wrote nothing.
    NotStarted,
    Skipped,
}

/// Owns the story's single backup slot and restores from it.
pub struct RollbackManager {
    backup: Mutex<Option<Held>>,
    gate: Arc<TurnGate>,
    activation: Arc<Mutex<ActivationTracker>>,
}

impl RollbackManager {
    pub fn new(gate: Arc<TurnGate>, activation: Arc<Mutex<ActivationTracker>>) -> Self {
        Self {
            backup: Mutex::new(None),
            gate,
            activation,
        }
    }

    pub fn gate(&self) -> &Arc<TurnGate> {
        &self.gate
    }

    /// Store the pre-turn backup, replacing any previous one.
    pub async fn create_backup(&self, backup: RetryBackup) {
        self.store_backup(backup, None).await;
    }

    /// Store the backup taken by `turn`. A stop only restores it while `turn`
    /// is the latest turn started on the gate.
    pub async fn create_backup_for_turn(&self, backup: RetryBackup, turn: TurnTicket) {
        self.store_backup(backup, Some(turn)).await;
    }

    async fn store_backup(&self, backup: RetryBackup, owner: Option<TurnTicket>) {
        debug!(
            story = %backup.story_id,
            position = backup.story_position,
            full_state = backup.has_full_state,
            "Backup created"
        );
        *self.backup.lock().await = Some(Held { backup, owner });
    }

    pub async fn backup(&self) -> Option<RetryBackup> {
        self.backup.lock().await.as_ref().map(|held| held.backup.clone())
    }

    pub async fn has_backup_for(&self, story: StoryId) -> bool {
        self.backup
            .lock()
            .await
            .as_ref()
            .is_some_and(|held| held.backup.story_id == story)
    }

    /// Drop the backup if it belongs to `story`.
    pub async fn invalidate_for_story(&self, story: StoryId) {
        let mut slot = self.backup.lock().await;
        if slot.as_ref().is_some_and(|held| held.backup.story_id == story) {
            debug!(%story, "Backup invalidated");
            *slot = None;
        }
    }

    pub async fn clear(&self) {
        *self.backup.lock().await = None;
    }

    /// Stop the in-flight turn and undo everything it wrote.
    ///
    /// Succeeds when the story is back at its pre-turn state: either the backup
    /// was restored, or the stopped turn had not written anything yet.
    pub async fn handle_stop_generation(&self, store: &dyn StoryStore, ui: &dyn UiOps) -> StopOutcome {
        let success = !matches!(self.rollback(store, ui).await, Rollback::Skipped);
        StopOutcome { success }
    }

    /// Undo the last turn and hand back its input for resubmission.
    pub async fn handle_retry_last_message(&self, store: &dyn StoryStore, ui: &dyn UiOps) -> RetryOutcome {
        match self.rollback(store, ui).await {
            Rollback::Restored(backup) => RetryOutcome {
                success: true,
                restored_raw_input: Some(backup.raw_input),
                restored_action_type: Some(backup.action_type),
                restored_was_raw_action_choice: Some(backup.was_raw_action_choice),
                restored_user_action_entry_id: backup.user_action_entry_id,
            },
            Rollback::NotStarted | Rollback::Skipped => RetryOutcome::default(),
        }
    }

    /// Shared stop/retry path. The backup is consumed only by a successful restore.
    async fn rollback(&self, store: &dyn StoryStore, ui: &dyn UiOps) -> Rollback {
        let latest = self.gate.latest_turn();
        ui.abort_generation();
        self.gate.invalidate();
        let _restoring = self.gate.lock().await;

        let mut slot = self.backup.lock().await;
        let outcome = match slot.take() {
            None => {
                debug!("No backup to restore");
                Rollback::Skipped
            }
            Some(mut held) if held.owner.is_some_and(|owner| Some(owner) != latest) => {
                debug!("Stopped turn had not backed up yet, keeping the previous backup");
                // The newer turn wrote nothing, so the kept backup still undoes the last turn.
                held.owner = latest;
                *slot = Some(held);
                Rollback::NotStarted
            }
            Some(held) if !held.backup.is_valid_for(ui.active_story()) => {
                warn!(story = %held.backup.story_id, "Discarding backup for an inactive story");
                Rollback::Skipped
            }
            Some(held) => match self.restore(store, &held.backup).await {
                Ok(()) => Rollback::Restored(held.backup),
                Err(e) => {
                    warn!(
                        story = %held.backup.story_id,
                        error = %e,
                        "Rollback failed, backup kept for another attempt"
                    );
                    *slot = Some(held);
                    Rollback::Skipped
                }
            },
        };
        drop(slot);

        ui.set_generating(false);
        ui.clear_transient();
        outcome
    }

    #[tracing::instrument(skip_all, fields(story = %backup.story_id, position = backup.story_position))]
    async fn restore(&self, store: &dyn StoryStore, backup: &RetryBackup) -> Result<(), StoreError> {
        let story = backup.story_id;

        let entries = store
            .delete_entries_from_position(story, backup.story_position)
            .await?;
        let entities = store
            .delete_entities_created_after(story, backup.created_at)
            .await?;

        let mut restored = 0;
        if let Some(world) = backup.world_snapshot.as_ref().filter(|_| backup.has_full_state) {
            restored = store.restore_entity_snapshots(story, world).await?;
        }

        store.set_time(story, backup.time_tracker).await?;

        let mut tracker = self.activation.lock().await;
        match backup.activation_state.clone().filter(|_| backup.has_full_state) {
            Some(state) => tracker.restore(state),
            None => tracker.clear(),
        }

        info!(entries, entities, restored, "Turn rolled back");
        Ok(())
    }
}

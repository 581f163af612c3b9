//! Turn tickets and the retry lock that fence off stale side effects.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, MutexGuard};

/// Identifies one turn. Only the latest ticket is current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TurnTicket(u64);

/// Serializes rollback against in-flight turns.
///
/// Every turn takes a ticket; stopping or retrying invalidates it and holds the
/// retry lock while the story is restored. Side effects of a turn are admitted
/// only while its ticket is current and no restore is running.
#[derive(Debug, Default)]
pub struct TurnGate {
    current: AtomicU64,
    /// Ticket of the most recently started turn; unaffected by `invalidate`.
    latest: AtomicU64,
    retry_lock: Mutex<()>,
}

impl TurnGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_turn(&self) -> TurnTicket {
        let ticket = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest.fetch_max(ticket, Ordering::SeqCst);
        TurnTicket(ticket)
    }

    /// The last turn started, whether or not it is still current.
    pub fn latest_turn(&self) -> Option<TurnTicket> {
        match self.latest.load(Ordering::SeqCst) {
            0 => None,
            ticket => Some(TurnTicket(ticket)),
        }
    }

    /// Make every outstanding ticket stale.
    pub fn invalidate(&self) {
        self.current.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_current(&self, ticket: TurnTicket) -> bool {
        self.current.load(Ordering::SeqCst) == ticket.0
    }

    pub fn is_restoring(&self) -> bool {
        self.retry_lock.try_lock().is_err()
    }

    pub fn admits(&self, ticket: TurnTicket) -> bool {
        self.is_current(ticket) && !self.is_restoring()
    }

    /// Hold the retry lock for a whole restore.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.retry_lock.lock().await
    }
}

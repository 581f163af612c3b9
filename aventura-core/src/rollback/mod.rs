//! Pre-turn backups and exact rollback for stop and retry.

mod backup;
mod gate;
mod manager;

pub use backup::{ActionType, RetryBackup};
pub use gate::{TurnGate, TurnTicket};
pub use manager::{RetryOutcome, RollbackManager, StopOutcome};

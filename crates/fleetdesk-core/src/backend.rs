use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::feed::{ChangeEnvelope, Entity};
use crate::records::{Agent, Command, LogEntry};

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("change feed unavailable: {0}")]
    Feed(String),
}

/// Collaborator surface the engine consumes. Implementations own the shared
/// database and publish every committed write on a broadcast change bus,
/// delivered at-least-once with no cross-entity ordering guarantee.
pub trait Backend: Send + Sync {
    /// Point-in-time fetch of all known agents, used for the initial load
    /// and for manual refresh.
    fn list_agents(&self) -> BoxFuture<'_, Result<Vec<Agent>, BackendError>>;

    /// Persists a new command in `pending` state and returns it with its
    /// assigned identifier.
    fn create_command(
        &self,
        agent_id: String,
        command: String,
    ) -> BoxFuture<'_, Result<Command, BackendError>>;

    fn insert_log_entry(&self, entry: LogEntry) -> BoxFuture<'_, Result<(), BackendError>>;

    fn purge_log_entries(&self) -> BoxFuture<'_, Result<(), BackendError>>;

    /// Subscribes to the change bus. Receivers observe all entities; the
    /// caller filters for `entity`.
    fn subscribe(&self, entity: Entity)
        -> Result<broadcast::Receiver<ChangeEnvelope>, BackendError>;
}

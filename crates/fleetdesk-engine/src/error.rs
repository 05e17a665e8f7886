use thiserror::Error;

use fleetdesk_core::BackendError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The create-command write failed. Not retried here; retry policy
    /// belongs to the caller.
    #[error("dispatch failed: {0}")]
    DispatchFailed(BackendError),

    /// A waiter is already registered for this command identifier.
    #[error("a result is already being awaited for command {0}")]
    DuplicateAwait(String),

    /// The target agent is unknown or offline.
    #[error("agent {0} is unknown or offline")]
    AgentUnavailable(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("engine is shut down")]
    Closed,
}

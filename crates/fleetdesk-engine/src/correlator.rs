use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use fleetdesk_core::{Backend, Command, CommandResult};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Completed(CommandResult),
    TimedOut,
}

/// Matches asynchronously arriving results to dispatched commands. The
/// correlation key is the command identifier, never the agent identifier:
/// any number of commands may be in flight concurrently, including several
/// against the same agent.
pub struct CommandCorrelator {
    backend: Arc<dyn Backend>,
    waiters: Mutex<HashMap<String, oneshot::Sender<CommandResult>>>,
}

impl CommandCorrelator {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub async fn dispatch(&self, agent_id: &str, command: &str) -> Result<Command, EngineError> {
        self.backend
            .create_command(agent_id.to_string(), command.to_string())
            .await
            .map_err(EngineError::DispatchFailed)
    }

    /// Suspends until the matching result arrives or the timeout elapses.
    /// Exactly one of the two outcomes occurs; the waiter is removed either
    /// way. A second concurrent wait on the same identifier fails fast.
    pub async fn await_result(
        &self,
        command_id: &str,
        timeout: Duration,
    ) -> Result<CommandOutcome, EngineError> {
        let mut rx = {
            let mut waiters = self.waiters.lock().unwrap();
            if waiters.contains_key(command_id) {
                return Err(EngineError::DuplicateAwait(command_id.to_string()));
            }
            let (tx, rx) = oneshot::channel();
            waiters.insert(command_id.to_string(), tx);
            rx
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => Ok(CommandOutcome::Completed(result)),
            Ok(Err(_)) => {
                // Sender dropped without resolving: the engine went away.
                self.waiters.lock().unwrap().remove(command_id);
                Err(EngineError::Closed)
            }
            Err(_) => {
                // Resolution and the deadline raced. `on_result` sends while
                // holding the table lock, so if the waiter is already gone
                // the result is sitting in the channel.
                let still_registered = self.waiters.lock().unwrap().remove(command_id).is_some();
                if still_registered {
                    return Ok(CommandOutcome::TimedOut);
                }
                match rx.try_recv() {
                    Ok(result) => Ok(CommandOutcome::Completed(result)),
                    Err(_) => Ok(CommandOutcome::TimedOut),
                }
            }
        }
    }

    /// Called from the change-feed path for every result insert. Results
    /// with no registered waiter (already resolved, timed out, or never
    /// awaited) are dropped here; they still reach display subscribers.
    /// Returns whether a waiter was resolved.
    pub fn on_result(&self, result: CommandResult) -> bool {
        let mut waiters = self.waiters.lock().unwrap();
        match waiters.remove(&result.command_id) {
            Some(tx) => {
                let command_id = result.command_id.clone();
                if tx.send(result).is_err() {
                    warn!(event = "result_receiver_gone", command_id = %command_id);
                    return false;
                }
                true
            }
            None => {
                debug!(event = "result_unclaimed", command_id = %result.command_id);
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_waiters(&self) -> usize {
        self.waiters.lock().unwrap().len()
    }
}

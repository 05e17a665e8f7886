use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;

use fleetdesk_core::{
    Agent, AgentStatus, Backend, BackendError, ChangeEnvelope, Command, CommandResult,
    CommandStatus, Entity, LogEntry,
};

const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Default)]
struct Tables {
    agents: Vec<Agent>,
    commands: Vec<Command>,
    results: Vec<CommandResult>,
    log_entries: Vec<LogEntry>,
}

/// In-memory backend with the same change-bus contract as the sqlite
/// store. Used in tests and demos; `close_feed` simulates losing the
/// pub/sub channel while the tables stay reachable.
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    bus: Mutex<Option<broadcast::Sender<ChangeEnvelope>>>,
    fail_writes: AtomicBool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(DEFAULT_BUS_CAPACITY);
        Self {
            tables: Mutex::new(Tables::default()),
            bus: Mutex::new(Some(bus)),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Drops the bus sender: live receivers observe `Closed` and new
    /// subscriptions fail until `reopen_feed`.
    pub fn close_feed(&self) {
        self.bus.lock().unwrap().take();
    }

    pub fn reopen_feed(&self) {
        let (bus, _) = broadcast::channel(DEFAULT_BUS_CAPACITY);
        *self.bus.lock().unwrap() = Some(bus);
    }

    pub fn publish(&self, envelope: ChangeEnvelope) {
        if let Some(bus) = self.bus.lock().unwrap().as_ref() {
            let _ = bus.send(envelope);
        }
    }

    fn to_row<T: serde::Serialize>(record: &T) -> Value {
        serde_json::to_value(record).unwrap_or(Value::Null)
    }

    pub fn upsert_agent(&self, agent: Agent) {
        let inserted = {
            let mut tables = self.tables.lock().unwrap();
            match tables
                .agents
                .iter_mut()
                .find(|existing| existing.agent_id == agent.agent_id)
            {
                Some(existing) => {
                    *existing = agent.clone();
                    false
                }
                None => {
                    tables.agents.push(agent.clone());
                    true
                }
            }
        };
        let row = Self::to_row(&agent);
        self.publish(if inserted {
            ChangeEnvelope::insert(Entity::Agents, row)
        } else {
            ChangeEnvelope::update(Entity::Agents, row)
        });
    }

    pub fn heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> bool {
        let updated = {
            let mut tables = self.tables.lock().unwrap();
            match tables
                .agents
                .iter_mut()
                .find(|agent| agent.agent_id == agent_id)
            {
                Some(agent) => {
                    agent.last_seen = at;
                    agent.status = AgentStatus::Online;
                    Some(agent.clone())
                }
                None => None,
            }
        };
        match updated {
            Some(agent) => {
                self.publish(ChangeEnvelope::update(
                    Entity::Agents,
                    Self::to_row(&agent),
                ));
                true
            }
            None => false,
        }
    }

    pub fn delete_agent(&self, agent_id: &str) -> bool {
        let removed = {
            let mut tables = self.tables.lock().unwrap();
            let idx = tables
                .agents
                .iter()
                .position(|agent| agent.agent_id == agent_id);
            idx.map(|idx| tables.agents.remove(idx))
        };
        match removed {
            Some(agent) => {
                self.publish(ChangeEnvelope::delete(
                    Entity::Agents,
                    Self::to_row(&agent),
                ));
                true
            }
            None => false,
        }
    }

    /// Stores a result, moves the command terminal, and publishes both
    /// envelopes the way an endpoint write would.
    pub fn push_result(&self, result: CommandResult) {
        let command = {
            let mut tables = self.tables.lock().unwrap();
            tables.results.push(result.clone());
            match tables
                .commands
                .iter_mut()
                .find(|command| command.id == result.command_id)
            {
                Some(command) => {
                    command.status = if result.exit_code == 0 {
                        CommandStatus::Completed
                    } else {
                        CommandStatus::Failed
                    };
                    command.completed_at = Some(result.created_at);
                    Some(command.clone())
                }
                None => None,
            }
        };
        self.publish(ChangeEnvelope::insert(
            Entity::CommandResults,
            Self::to_row(&result),
        ));
        if let Some(command) = command {
            self.publish(ChangeEnvelope::update(
                Entity::Commands,
                Self::to_row(&command),
            ));
        }
    }

    pub fn commands(&self) -> Vec<Command> {
        self.tables.lock().unwrap().commands.clone()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.tables.lock().unwrap().log_entries.clone()
    }
}

impl Backend for MemoryBackend {
    fn list_agents(&self) -> BoxFuture<'_, Result<Vec<Agent>, BackendError>> {
        Box::pin(async move { Ok(self.tables.lock().unwrap().agents.clone()) })
    }

    fn create_command(
        &self,
        agent_id: String,
        command: String,
    ) -> BoxFuture<'_, Result<Command, BackendError>> {
        Box::pin(async move {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(BackendError::Storage("write rejected".to_string()));
            }
            let record = Command {
                id: uuid::Uuid::new_v4().to_string(),
                agent_id,
                command,
                status: CommandStatus::Pending,
                created_at: Utc::now(),
                completed_at: None,
            };
            self.tables.lock().unwrap().commands.push(record.clone());
            self.publish(ChangeEnvelope::insert(
                Entity::Commands,
                Self::to_row(&record),
            ));
            Ok(record)
        })
    }

    fn insert_log_entry(&self, entry: LogEntry) -> BoxFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(BackendError::Storage("write rejected".to_string()));
            }
            self.tables.lock().unwrap().log_entries.push(entry.clone());
            self.publish(ChangeEnvelope::insert(
                Entity::EventLogs,
                Self::to_row(&entry),
            ));
            Ok(())
        })
    }

    fn purge_log_entries(&self) -> BoxFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(BackendError::Storage("write rejected".to_string()));
            }
            self.tables.lock().unwrap().log_entries.clear();
            Ok(())
        })
    }

    fn subscribe(
        &self,
        _entity: Entity,
    ) -> Result<broadcast::Receiver<ChangeEnvelope>, BackendError> {
        self.bus
            .lock()
            .unwrap()
            .as_ref()
            .map(|bus| bus.subscribe())
            .ok_or_else(|| BackendError::Feed("change bus closed".to_string()))
    }
}

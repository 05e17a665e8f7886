use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use fleetdesk_core::{
    Agent, AgentStatus, Backend, BackendError, ChangeEnvelope, ChangeOp, Command, CommandResult,
    CommandStatus, Entity, FileListing, LogEntry, LogSeverity, Screenshot,
};

use crate::error::StoreError;
use crate::journal::FeedJournal;

pub const FLEET_SCHEMA_VERSION: i64 = 1;

const DEFAULT_BUS_CAPACITY: usize = 256;

/// Shared fleet database plus its change bus. Every committed write is
/// published as a [`ChangeEnvelope`] on the bus, so consoles holding a
/// subscription converge on the database state without polling.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    bus: broadcast::Sender<ChangeEnvelope>,
    journal: Option<FeedJournal>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let (bus, _) = broadcast::channel(DEFAULT_BUS_CAPACITY);
        let store = Self {
            conn: Mutex::new(conn),
            bus,
            journal: None,
        };
        store.migrate()?;
        Ok(store)
    }

    /// Mirrors every published envelope to an NDJSON journal file.
    pub fn with_journal(mut self, journal: FeedJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > FLEET_SCHEMA_VERSION {
            return Err(StoreError::UnsupportedSchemaVersion {
                found: current,
                supported: FLEET_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_fleet_schema.sql");
            conn.execute_batch(sql)?;
            conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }

        Ok(())
    }

    fn publish(&self, envelope: ChangeEnvelope) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.append(&envelope) {
                warn!(event = "journal_append_failed", error = %err);
            }
        }
        // No subscribers is fine; the envelope is simply not observed.
        let _ = self.bus.send(envelope);
    }

    fn emit(&self, entity: Entity, op: ChangeOp, row: Value) {
        let envelope = match op {
            ChangeOp::Insert => ChangeEnvelope::insert(entity, row),
            ChangeOp::Update => ChangeEnvelope::update(entity, row),
            ChangeOp::Delete => ChangeEnvelope::delete(entity, row),
        };
        self.publish(envelope);
    }

    fn to_row<T: serde::Serialize>(record: &T) -> Result<Value, StoreError> {
        serde_json::to_value(record).map_err(|err| StoreError::Serialization(err.to_string()))
    }

    pub fn upsert_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let system_info_json = serde_json::to_string(&agent.system_info)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;

        let existed = {
            let conn = self.conn.lock().unwrap();
            let existed = conn
                .query_row(
                    "SELECT 1 FROM agents WHERE agent_id = ?1 LIMIT 1",
                    [&agent.agent_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();

            conn.execute(
                "
                INSERT INTO agents (
                    agent_id,
                    hostname,
                    username,
                    ip_address,
                    os_info,
                    status,
                    last_seen,
                    created_at,
                    system_info_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(agent_id) DO UPDATE SET
                    hostname=excluded.hostname,
                    username=excluded.username,
                    ip_address=excluded.ip_address,
                    os_info=excluded.os_info,
                    status=excluded.status,
                    last_seen=excluded.last_seen,
                    system_info_json=excluded.system_info_json
                ",
                params![
                    agent.agent_id,
                    agent.hostname,
                    agent.username,
                    agent.ip_address,
                    agent.os_info,
                    agent.status.as_str(),
                    agent.last_seen.to_rfc3339(),
                    agent.created_at.to_rfc3339(),
                    system_info_json,
                ],
            )?;
            existed
        };

        let op = if existed {
            ChangeOp::Update
        } else {
            ChangeOp::Insert
        };
        self.emit(Entity::Agents, op, Self::to_row(agent)?);
        Ok(())
    }

    /// Refreshes `last_seen` and forces the agent back to `online`.
    pub fn heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let changed = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE agents SET last_seen = ?2, status = 'online' WHERE agent_id = ?1",
                params![agent_id, at.to_rfc3339()],
            )?
        };
        if changed == 0 {
            return Ok(false);
        }
        if let Some(agent) = self.agent(agent_id)? {
            self.emit(Entity::Agents, ChangeOp::Update, Self::to_row(&agent)?);
        }
        Ok(true)
    }

    pub fn mark_agent_offline(&self, agent_id: &str) -> Result<bool, StoreError> {
        let changed = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE agents SET status = 'offline' WHERE agent_id = ?1",
                [agent_id],
            )?
        };
        if changed == 0 {
            return Ok(false);
        }
        if let Some(agent) = self.agent(agent_id)? {
            self.emit(Entity::Agents, ChangeOp::Update, Self::to_row(&agent)?);
        }
        Ok(true)
    }

    pub fn delete_agent(&self, agent_id: &str) -> Result<bool, StoreError> {
        let old = self.agent(agent_id)?;
        let Some(old) = old else {
            return Ok(false);
        };
        {
            let conn = self.conn.lock().unwrap();
            conn.execute("DELETE FROM agents WHERE agent_id = ?1", [agent_id])?;
        }
        self.emit(Entity::Agents, ChangeOp::Delete, Self::to_row(&old)?);
        Ok(true)
    }

    pub fn agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let agent = conn
            .query_row(
                "
                SELECT agent_id, hostname, username, ip_address, os_info, status,
                       last_seen, created_at, system_info_json
                FROM agents
                WHERE agent_id = ?1
                ",
                [agent_id],
                agent_from_row,
            )
            .optional()?;
        Ok(agent)
    }

    pub fn list_agents_sync(&self) -> Result<Vec<Agent>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "
            SELECT agent_id, hostname, username, ip_address, os_info, status,
                   last_seen, created_at, system_info_json
            FROM agents
            ORDER BY created_at ASC, agent_id ASC
            ",
        )?;
        let rows = statement.query_map([], agent_from_row)?;

        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?);
        }
        Ok(agents)
    }

    pub fn create_command_sync(
        &self,
        agent_id: &str,
        command: &str,
    ) -> Result<Command, StoreError> {
        let record = Command {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            command: command.to_string(),
            status: CommandStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        };
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "
                INSERT INTO commands (id, agent_id, command, status, created_at, completed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, NULL)
                ",
                params![
                    record.id,
                    record.agent_id,
                    record.command,
                    record.status.as_str(),
                    record.created_at.to_rfc3339(),
                ],
            )?;
        }
        self.emit(Entity::Commands, ChangeOp::Insert, Self::to_row(&record)?);
        Ok(record)
    }

    pub fn update_command_status(
        &self,
        command_id: &str,
        status: CommandStatus,
    ) -> Result<bool, StoreError> {
        let completed_at = status.is_terminal().then(Utc::now);
        let changed = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE commands SET status = ?2, completed_at = ?3 WHERE id = ?1",
                params![
                    command_id,
                    status.as_str(),
                    completed_at.map(|at| at.to_rfc3339()),
                ],
            )?
        };
        if changed == 0 {
            return Ok(false);
        }
        if let Some(command) = self.command(command_id)? {
            self.emit(Entity::Commands, ChangeOp::Update, Self::to_row(&command)?);
        }
        Ok(true)
    }

    pub fn command(&self, command_id: &str) -> Result<Option<Command>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let command = conn
            .query_row(
                "
                SELECT id, agent_id, command, status, created_at, completed_at
                FROM commands
                WHERE id = ?1
                ",
                [command_id],
                command_from_row,
            )
            .optional()?;
        Ok(command)
    }

    /// Records a result and moves its command to the matching terminal
    /// state. Re-inserting the same result id is a no-op.
    pub fn insert_result(&self, result: &CommandResult) -> Result<bool, StoreError> {
        let inserted = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "
                INSERT OR IGNORE INTO command_results (
                    id, command_id, agent_id, output, exit_code, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    result.id,
                    result.command_id,
                    result.agent_id,
                    result.output,
                    result.exit_code,
                    result.created_at.to_rfc3339(),
                ],
            )?
        } > 0;
        if !inserted {
            return Ok(false);
        }

        self.emit(
            Entity::CommandResults,
            ChangeOp::Insert,
            Self::to_row(result)?,
        );

        let status = if result.exit_code == 0 {
            CommandStatus::Completed
        } else {
            CommandStatus::Failed
        };
        self.update_command_status(&result.command_id, status)?;
        Ok(true)
    }

    pub fn upsert_file_listing(&self, listing: &FileListing) -> Result<(), StoreError> {
        let entries_json = serde_json::to_string(&listing.entries)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let existed = {
            let conn = self.conn.lock().unwrap();
            let existed = conn
                .query_row(
                    "SELECT 1 FROM file_listings WHERE agent_id = ?1 AND path = ?2 LIMIT 1",
                    params![listing.agent_id, listing.path],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            conn.execute(
                "
                INSERT INTO file_listings (agent_id, path, entries_json, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(agent_id, path) DO UPDATE SET
                    entries_json=excluded.entries_json,
                    updated_at=excluded.updated_at
                ",
                params![
                    listing.agent_id,
                    listing.path,
                    entries_json,
                    listing.updated_at.to_rfc3339(),
                ],
            )?;
            existed
        };

        let op = if existed {
            ChangeOp::Update
        } else {
            ChangeOp::Insert
        };
        self.emit(Entity::FileListings, op, Self::to_row(listing)?);
        Ok(())
    }

    pub fn insert_screenshot(&self, shot: &Screenshot) -> Result<(), StoreError> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "
                INSERT INTO screenshots (id, agent_id, storage_path, width, height, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    shot.id,
                    shot.agent_id,
                    shot.storage_path,
                    shot.width,
                    shot.height,
                    shot.created_at.to_rfc3339(),
                ],
            )?;
        }
        self.emit(Entity::Screenshots, ChangeOp::Insert, Self::to_row(shot)?);
        Ok(())
    }

    pub fn insert_log_entry_sync(&self, entry: &LogEntry) -> Result<(), StoreError> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "
                INSERT OR IGNORE INTO event_logs (id, time, severity, message, agent_id)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![
                    entry.id,
                    entry.time.to_rfc3339(),
                    entry.severity.as_str(),
                    entry.message,
                    entry.agent_id,
                ],
            )?;
        }
        self.emit(Entity::EventLogs, ChangeOp::Insert, Self::to_row(entry)?);
        Ok(())
    }

    pub fn purge_log_entries_sync(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute("DELETE FROM event_logs", [])?)
    }

    pub fn list_log_entries(&self) -> Result<Vec<LogEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "
            SELECT id, time, severity, message, agent_id
            FROM event_logs
            ORDER BY time ASC, id ASC
            ",
        )?;
        let rows = statement.query_map([], log_entry_from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

impl Backend for SqliteStore {
    fn list_agents(&self) -> BoxFuture<'_, Result<Vec<Agent>, BackendError>> {
        Box::pin(async move { self.list_agents_sync().map_err(BackendError::from) })
    }

    fn create_command(
        &self,
        agent_id: String,
        command: String,
    ) -> BoxFuture<'_, Result<Command, BackendError>> {
        Box::pin(async move {
            self.create_command_sync(&agent_id, &command)
                .map_err(BackendError::from)
        })
    }

    fn insert_log_entry(&self, entry: LogEntry) -> BoxFuture<'_, Result<(), BackendError>> {
        Box::pin(async move { self.insert_log_entry_sync(&entry).map_err(BackendError::from) })
    }

    fn purge_log_entries(&self) -> BoxFuture<'_, Result<(), BackendError>> {
        Box::pin(async move {
            self.purge_log_entries_sync()
                .map(|_| ())
                .map_err(BackendError::from)
        })
    }

    fn subscribe(
        &self,
        _entity: Entity,
    ) -> Result<broadcast::Receiver<ChangeEnvelope>, BackendError> {
        Ok(self.bus.subscribe())
    }
}

fn text_conversion_err(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn row_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| text_conversion_err(idx, err))
}

fn agent_from_row(row: &rusqlite::Row<'_>) -> Result<Agent, rusqlite::Error> {
    let status_raw: String = row.get(5)?;
    let status = status_raw
        .parse::<AgentStatus>()
        .map_err(|err| text_conversion_err(5, err))?;
    let system_info_json: String = row.get(8)?;
    let system_info: HashMap<String, Value> =
        serde_json::from_str(&system_info_json).map_err(|err| text_conversion_err(8, err))?;

    Ok(Agent {
        agent_id: row.get(0)?,
        hostname: row.get(1)?,
        username: row.get(2)?,
        ip_address: row.get(3)?,
        os_info: row.get(4)?,
        status,
        last_seen: row_timestamp(row, 6)?,
        created_at: row_timestamp(row, 7)?,
        system_info,
    })
}

fn command_from_row(row: &rusqlite::Row<'_>) -> Result<Command, rusqlite::Error> {
    let status_raw: String = row.get(3)?;
    let status = status_raw
        .parse::<CommandStatus>()
        .map_err(|err| text_conversion_err(3, err))?;
    let completed_at = row
        .get::<_, Option<String>>(5)?
        .map(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .map(|timestamp| timestamp.with_timezone(&Utc))
                .map_err(|err| text_conversion_err(5, err))
        })
        .transpose()?;

    Ok(Command {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        command: row.get(2)?,
        status,
        created_at: row_timestamp(row, 4)?,
        completed_at,
    })
}

fn log_entry_from_row(row: &rusqlite::Row<'_>) -> Result<LogEntry, rusqlite::Error> {
    let severity_raw: String = row.get(2)?;
    let severity = severity_raw
        .parse::<LogSeverity>()
        .map_err(|err| text_conversion_err(2, err))?;

    Ok(LogEntry {
        id: row.get(0)?,
        time: row_timestamp(row, 1)?,
        severity,
        message: row.get(3)?,
        agent_id: row.get(4)?,
    })
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Sleeping,
    Offline,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Sleeping => "sleeping",
            Self::Offline => "offline",
        }
    }
}

impl FromStr for AgentStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "online" => Ok(Self::Online),
            "sleeping" => Ok(Self::Sleeping),
            "offline" => Ok(Self::Offline),
            other => Err(UnknownVariant::new("agent status", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub agent_id: String,
    pub hostname: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub os_info: Option<String>,
    pub status: AgentStatus,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub system_info: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for CommandStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant::new("command status", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub id: String,
    pub agent_id: String,
    pub command: String,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub id: String,
    pub command_id: String,
    pub agent_id: String,
    pub output: String,
    pub exit_code: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    Info,
    Success,
    Warning,
    Error,
}

impl LogSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogSeverity {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "info" => Ok(Self::Info),
            "success" => Ok(Self::Success),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(UnknownVariant::new("log severity", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: String,
    pub time: DateTime<Utc>,
    pub severity: LogSeverity,
    pub message: String,
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl LogEntry {
    pub fn new(severity: LogSeverity, message: impl Into<String>, agent_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            time: Utc::now(),
            severity,
            message: message.into(),
            agent_id,
        }
    }

    pub fn render(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.time.format("%Y-%m-%d %H:%M:%S"),
            self.severity.as_str().to_ascii_uppercase(),
            self.message
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub kind: String,
    pub size: String,
    pub modified: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileListing {
    pub agent_id: String,
    pub path: String,
    #[serde(default)]
    pub entries: Vec<FileEntry>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Screenshot {
    pub id: String,
    pub agent_id: String,
    pub storage_path: String,
    pub width: u32,
    pub height: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub field: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(field: &'static str, value: &str) -> Self {
        Self {
            field,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {}: {}", self.field, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [AgentStatus::Online, AgentStatus::Sleeping, AgentStatus::Offline] {
            assert_eq!(status.as_str().parse::<AgentStatus>(), Ok(status));
        }
        assert!("away".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn log_entry_renders_with_uppercase_severity() {
        let entry = LogEntry {
            id: "log-1".to_string(),
            time: chrono::TimeZone::with_ymd_and_hms(&Utc, 2026, 3, 14, 9, 26, 53).unwrap(),
            severity: LogSeverity::Warning,
            message: "Agent AGT-1 marked offline (stale)".to_string(),
            agent_id: Some("AGT-1".to_string()),
        };
        assert_eq!(
            entry.render(),
            "[2026-03-14 09:26:53] [WARNING] Agent AGT-1 marked offline (stale)"
        );
    }

    #[test]
    fn agent_defaults_optional_fields_on_deserialize() {
        let raw = r#"{
            "agent_id": "AGT-1",
            "hostname": "desk-01",
            "status": "online",
            "last_seen": "2026-03-14T09:26:53Z",
            "created_at": "2026-03-14T09:00:00Z"
        }"#;
        let agent: Agent = serde_json::from_str(raw).expect("parse agent");
        assert_eq!(agent.status, AgentStatus::Online);
        assert!(agent.username.is_none());
        assert!(agent.system_info.is_empty());
    }
}

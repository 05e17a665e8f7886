use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Agents,
    Commands,
    CommandResults,
    FileListings,
    Screenshots,
    EventLogs,
}

impl Entity {
    pub const ALL: [Entity; 6] = [
        Entity::Agents,
        Entity::Commands,
        Entity::CommandResults,
        Entity::FileListings,
        Entity::Screenshots,
        Entity::EventLogs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agents => "agents",
            Self::Commands => "commands",
            Self::CommandResults => "command_results",
            Self::FileListings => "file_listings",
            Self::Screenshots => "screenshots",
            Self::EventLogs => "event_logs",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEnvelope {
    pub entity: Entity,
    pub op: ChangeOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_row: Option<Value>,
    pub emitted_at: DateTime<Utc>,
}

impl ChangeEnvelope {
    pub fn insert(entity: Entity, row: Value) -> Self {
        Self {
            entity,
            op: ChangeOp::Insert,
            row: Some(row),
            old_row: None,
            emitted_at: Utc::now(),
        }
    }

    pub fn update(entity: Entity, row: Value) -> Self {
        Self {
            entity,
            op: ChangeOp::Update,
            row: Some(row),
            old_row: None,
            emitted_at: Utc::now(),
        }
    }

    pub fn delete(entity: Entity, old_row: Value) -> Self {
        Self {
            entity,
            op: ChangeOp::Delete,
            row: None,
            old_row: Some(old_row),
            emitted_at: Utc::now(),
        }
    }

    /// New row for insert/update, old row for delete.
    pub fn payload(&self) -> Option<&Value> {
        match self.op {
            ChangeOp::Insert | ChangeOp::Update => self.row.as_ref(),
            ChangeOp::Delete => self.old_row.as_ref(),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        let payload = self.payload()?;
        serde_json::from_value(payload.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame(
    envelope: &ChangeEnvelope,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(envelope).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame(bytes: &[u8], max_frame_bytes: usize) -> Result<ChangeEnvelope, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct DecodeReport {
    pub envelopes: Vec<ChangeEnvelope>,
    pub errors: Vec<FrameError>,
}

/// Incremental NDJSON decoder for change-feed streams. A malformed or
/// oversized line is reported and skipped; decoding continues with the
/// next line.
pub struct FrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut frame = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            if frame.ends_with(b"\n") {
                frame.pop();
            }
            if frame.ends_with(b"\r") {
                frame.pop();
            }
            if frame.is_empty() {
                continue;
            }
            self.decode_line(&frame, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    pub fn finish(&mut self) -> DecodeReport {
        if self.pending.is_empty() {
            return DecodeReport::default();
        }
        let last = std::mem::take(&mut self.pending);
        let mut report = DecodeReport::default();
        self.decode_line(&last, &mut report);
        report
    }

    fn decode_line(&self, line: &[u8], report: &mut DecodeReport) {
        if line.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: line.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(line) {
            Ok(envelope) => report.envelopes.push(envelope),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use fleetdesk_core::{encode_frame, ChangeEnvelope, FrameDecoder, DEFAULT_MAX_FRAME_BYTES};

use crate::error::StoreError;

/// Append-only NDJSON record of every envelope published on the change
/// bus. Replayable later for diagnosis or to drive an offline console.
pub struct FeedJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FeedJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, envelope: &ChangeEnvelope) -> Result<(), StoreError> {
        let frame = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES)?;
        let mut file = self.file.lock().unwrap();
        file.write_all(&frame)?;
        file.flush()?;
        Ok(())
    }
}

/// Reads a journal back, skipping malformed lines with a warning.
pub fn read_journal(path: impl AsRef<Path>) -> Result<Vec<ChangeEnvelope>, StoreError> {
    let mut file = File::open(path.as_ref())?;
    let mut decoder = FrameDecoder::default();
    let mut envelopes = Vec::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        let report = decoder.push_chunk(&buf[..read]);
        for err in &report.errors {
            warn!(event = "journal_frame_skipped", error = %err);
        }
        envelopes.extend(report.envelopes);
    }
    let tail = decoder.finish();
    for err in &tail.errors {
        warn!(event = "journal_frame_skipped", error = %err);
    }
    envelopes.extend(tail.envelopes);
    Ok(envelopes)
}

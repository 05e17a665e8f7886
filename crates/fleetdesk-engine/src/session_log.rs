use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use fleetdesk_core::{Backend, LogEntry, LogSeverity};

pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// Bounded append-only event log, oldest first. Eviction is strict FIFO;
/// entries are never mutated after insertion.
#[derive(Debug)]
pub struct SessionLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl SessionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1_024)),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    pub fn append(&mut self, entry: LogEntry) -> Option<LogEntry> {
        self.entries.push_back(entry);
        if self.entries.len() > self.capacity {
            self.entries.pop_front()
        } else {
            None
        }
    }

    pub fn clear(&mut self) -> usize {
        let cleared = self.entries.len();
        self.entries.clear();
        cleared
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn export_text(&self) -> String {
        self.entries
            .iter()
            .map(LogEntry::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Shared handle over the session log plus its external counterpart
/// (`event_logs`). Local appends always succeed; external writes are
/// best-effort.
#[derive(Clone)]
pub struct SessionLogHandle {
    inner: Arc<Mutex<SessionLog>>,
    backend: Arc<dyn Backend>,
}

impl SessionLogHandle {
    pub fn new(capacity: usize, backend: Arc<dyn Backend>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionLog::new(capacity))),
            backend,
        }
    }

    /// Appends locally only. Used for entries derived from the change feed
    /// and for engine-internal events, which already exist externally or
    /// are purely local.
    pub fn append_local(&self, entry: LogEntry) {
        if let Some(evicted) = self.inner.lock().unwrap().append(entry) {
            debug!(event = "log_evicted", id = %evicted.id);
        }
    }

    /// Appends an entry arriving on the `event_logs` change feed, absorbing
    /// at-least-once redelivery by id.
    pub fn append_from_feed(&self, entry: LogEntry) -> bool {
        let mut log = self.inner.lock().unwrap();
        if log.contains_id(&entry.id) {
            debug!(event = "log_duplicate_dropped", id = %entry.id);
            return false;
        }
        log.append(entry);
        true
    }

    /// Appends locally and mirrors the entry to the external log for other
    /// console sessions. An external write failure only logs a warning.
    pub async fn record(&self, entry: LogEntry) {
        self.append_local(entry.clone());
        if let Err(err) = self.backend.insert_log_entry(entry).await {
            warn!(event = "log_mirror_failed", error = %err);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.lock().unwrap().entries()
    }

    pub fn export_text(&self) -> String {
        self.inner.lock().unwrap().export_text()
    }

    /// Empties the local buffer and issues a best-effort external purge.
    /// The local clear happens regardless; a failed purge is itself
    /// reported as a new warning entry.
    pub async fn clear(&self) -> usize {
        let cleared = self.inner.lock().unwrap().clear();
        if let Err(err) = self.backend.purge_log_entries().await {
            warn!(event = "log_purge_failed", error = %err);
            self.append_local(LogEntry::new(
                LogSeverity::Warning,
                format!("Failed to purge external event log: {err}"),
                None,
            ));
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;

    fn entry(id: &str, message: &str) -> LogEntry {
        LogEntry {
            id: id.to_string(),
            time: Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).unwrap(),
            severity: LogSeverity::Info,
            message: message.to_string(),
            agent_id: None,
        }
    }

    #[test]
    fn append_beyond_capacity_evicts_oldest_first() {
        let mut log = SessionLog::new(3);
        for i in 0..5 {
            log.append(entry(&format!("e{i}"), &format!("message {i}")));
        }
        assert_eq!(log.len(), 3);
        let ids = log.entries().iter().map(|e| e.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["e2", "e3", "e4"]);
    }

    #[test]
    fn export_is_chronological_one_line_per_entry() {
        let mut log = SessionLog::new(10);
        log.append(entry("e1", "first"));
        log.append(entry("e2", "second"));
        assert_eq!(
            log.export_text(),
            "[2026-03-14 10:00:00] [INFO] first\n[2026-03-14 10:00:00] [INFO] second"
        );
    }

    #[test]
    fn clear_empties_and_reports_count() {
        let mut log = SessionLog::new(10);
        log.append(entry("e1", "first"));
        log.append(entry("e2", "second"));
        assert_eq!(log.clear(), 2);
        assert!(log.is_empty());
        assert_eq!(log.export_text(), "");
    }
}

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::Utc;
use cnc_slot_ctrl::Slot;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{atomic, state::LastError};

pub type Result<T> = std::result::Result<T, HistoryError>;

#[allow(missing_docs)]
#[derive(thiserror::Error, Debug)]
pub enum HistoryError {
    #[error("failed writing shadow history file")]
    Write(#[source] std::io::Error),
    #[error("failed encoding shadow history")]
    Encode(#[source] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Watch,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Error,
    LockConflict,
}

/// One rebuild attempt as recorded for the status UI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub trigger: Trigger,
    pub result: Outcome,
    pub run_id: u64,
    pub active_slot_before: Slot,
    pub rebuild_slot: Slot,
    pub active_slot_after: Slot,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub error: Option<LastError>,
}

/// UTC wall clock at the second resolution history records use.
pub fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Bounded ring of rebuild attempts, persisted as a JSON array.
pub struct HistoryLog {
    path: PathBuf,
    limit: usize,
    entries: Mutex<Vec<HistoryEntry>>,
}

impl HistoryLog {
    pub fn new(path: PathBuf, limit: usize) -> Self {
        let entries = Self::load_entries(&path);
        Self {
            path,
            limit: limit.max(1),
            entries: Mutex::new(entries),
        }
    }

    fn load_entries(path: &Path) -> Vec<HistoryEntry> {
        let Ok(raw) = std::fs::read(path) else {
            return Vec::new();
        };
        match serde_json::from_slice(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, path = %path.display(), "ignoring malformed shadow history");
                Vec::new()
            }
        }
    }

    /// Append one entry, truncating the oldest past the cap, and atomically
    /// replace the backing file.
    pub fn append(&self, entry: HistoryEntry) -> Result<()> {
        let mut entries = self.entries.lock().expect("history mutex poisoned");
        entries.push(entry);
        let excess = entries.len().saturating_sub(self.limit);
        if excess > 0 {
            entries.drain(..excess);
        }

        let mut payload = serde_json::to_vec(&*entries).map_err(HistoryError::Encode)?;
        payload.push(b'\n');
        atomic::replace_file(&self.path, &payload, "shadow-history-")
            .map_err(HistoryError::Write)
    }

    /// Newest first, never more than `limit` entries (and never more than the
    /// configured cap).
    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.lock().expect("history mutex poisoned");
        entries
            .iter()
            .rev()
            .take(limit.min(self.limit))
            .cloned()
            .collect()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(run_id: u64) -> HistoryEntry {
        HistoryEntry {
            trigger: Trigger::Watch,
            result: Outcome::Ok,
            run_id,
            active_slot_before: Slot::A,
            rebuild_slot: Slot::B,
            active_slot_after: Slot::B,
            started_at: "2026-08-01T10:00:00Z".into(),
            finished_at: "2026-08-01T10:00:08Z".into(),
            duration_ms: 8000,
            error: None,
        }
    }

    #[test]
    fn it_returns_entries_newest_first() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path().join("history.json"), 50);
        for run_id in 1..=3 {
            log.append(entry(run_id)).unwrap();
        }

        let recent = log.recent(10);
        let run_ids: Vec<_> = recent.iter().map(|entry| entry.run_id).collect();
        assert_eq!(run_ids, vec![3, 2, 1]);
        assert_eq!(log.recent(2).len(), 2);
    }

    #[test]
    fn it_truncates_the_head_past_the_cap() {
        let dir = TempDir::new().unwrap();
        let log = HistoryLog::new(dir.path().join("history.json"), 3);
        for run_id in 1..=5 {
            log.append(entry(run_id)).unwrap();
        }

        let run_ids: Vec<_> = log.recent(10).iter().map(|entry| entry.run_id).collect();
        assert_eq!(run_ids, vec![5, 4, 3]);

        // The persisted file obeys the cap too.
        let raw = std::fs::read(log.path()).unwrap();
        let persisted: Vec<HistoryEntry> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(persisted.len(), 3);
    }

    #[test]
    fn it_survives_a_process_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        HistoryLog::new(path.clone(), 50).append(entry(9)).unwrap();

        let reloaded = HistoryLog::new(path, 50);
        assert_eq!(reloaded.recent(1)[0].run_id, 9);
    }

    #[test]
    fn it_treats_malformed_payloads_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.json");

        std::fs::write(&path, b"{\"not\": \"a list\"}").unwrap();
        assert!(HistoryLog::new(path.clone(), 50).recent(10).is_empty());

        std::fs::write(&path, b"garbage").unwrap();
        assert!(HistoryLog::new(path, 50).recent(10).is_empty());
    }

    #[test]
    fn it_serializes_the_documented_wire_names() {
        let json = serde_json::to_value(entry(4)).unwrap();
        assert_eq!(json["trigger"], "watch");
        assert_eq!(json["result"], "ok");
        assert_eq!(json["active_slot_before"], "A");
        assert_eq!(json["active_slot_after"], "B");

        let conflict = HistoryEntry {
            result: Outcome::LockConflict,
            trigger: Trigger::Manual,
            ..entry(4)
        };
        let json = serde_json::to_value(conflict).unwrap();
        assert_eq!(json["result"], "lock_conflict");
        assert_eq!(json["trigger"], "manual");
    }

    #[test]
    fn it_formats_timestamps_to_the_second() {
        let stamp = utc_timestamp();
        // e.g. 2026-08-01T10:00:00Z
        assert_eq!(stamp.len(), 20);
        assert!(stamp.ends_with('Z'));
        assert_eq!(&stamp[4..5], "-");
        assert_eq!(&stamp[10..11], "T");
    }
}

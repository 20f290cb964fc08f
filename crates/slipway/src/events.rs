//! Append-only JSONL event log for pipeline runs.
//!
//! Events are buffered in memory and appended to `events.jsonl` in the
//! state directory whenever the engine flushes — after every release and at
//! run boundaries — so an interrupted run still leaves a usable trace.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ErrorClass, Stage};

pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub timestamp: DateTime<Utc>,
    /// Release id, or `"all"` for run-level events.
    pub release: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    RunStarted { release_count: usize },
    ReleaseStarted,
    ReleaseLeftFailed,
    StageSkipped { stage: Stage },
    StageStarted { stage: Stage },
    StageCompleted { stage: Stage, duration_ms: u64 },
    StageFailed { stage: Stage, class: ErrorClass, message: String },
    CheckpointInvalidated { stage: Stage, path: PathBuf },
    RegistrationSkipped { fingerprint: String },
    ReleaseCompleted,
    RunFinished { completed: usize, failed: usize },
}

/// Buffering writer for the event log. `flush` appends and clears.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    pending: Vec<PipelineEvent>,
}

impl EventLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path, pending: Vec::new() }
    }

    pub fn record(&mut self, release: &str, kind: EventKind) {
        self.pending.push(PipelineEvent {
            timestamp: Utc::now(),
            release: release.to_string(),
            kind,
        });
    }

    /// Append all buffered events to the log file and clear the buffer.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open events file {}", self.path.display()))?;
        let mut writer = BufWriter::new(file);
        for event in &self.pending {
            let line =
                serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;
        self.pending.clear();
        Ok(())
    }
}

/// Read all events from a JSONL file. Missing file reads as empty.
pub fn read_events(path: &Path) -> Result<Vec<PipelineEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)
        .with_context(|| format!("failed to open events file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line
            .with_context(|| format!("failed to read line from events file {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: PipelineEvent = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn flush_appends_and_clears() {
        let td = tempdir().expect("tempdir");
        let path = events_path(td.path());
        let mut log = EventLog::new(path.clone());

        log.record("all", EventKind::RunStarted { release_count: 2 });
        log.record("r1", EventKind::ReleaseStarted);
        log.flush().expect("flush");
        log.record("r1", EventKind::ReleaseCompleted);
        log.flush().expect("flush again");

        let events = read_events(&path).expect("read");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].release, "all");
        assert_eq!(events[2].kind, EventKind::ReleaseCompleted);
    }

    #[test]
    fn flush_with_no_events_writes_nothing() {
        let td = tempdir().expect("tempdir");
        let path = events_path(td.path());
        let mut log = EventLog::new(path.clone());
        log.flush().expect("flush");
        assert!(!path.exists());
    }

    #[test]
    fn events_serialize_with_tagged_kind() {
        let event = PipelineEvent {
            timestamp: Utc::now(),
            release: "r1".to_string(),
            kind: EventKind::StageFailed {
                stage: Stage::MetadataFetched,
                class: ErrorClass::Transient,
                message: "timeout".to_string(),
            },
        };
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"event\":\"stage_failed\""));
        assert!(json.contains("\"stage\":\"metadata_fetched\""));
        assert!(json.contains("\"class\":\"transient\""));

        let parsed: PipelineEvent = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.kind, event.kind);
    }

    #[test]
    fn read_events_skips_blank_lines() {
        let td = tempdir().expect("tempdir");
        let path = events_path(td.path());
        let mut log = EventLog::new(path.clone());
        log.record("r1", EventKind::ReleaseStarted);
        log.flush().expect("flush");
        fs::write(
            &path,
            format!("{}\n\n", fs::read_to_string(&path).expect("read")),
        )
        .expect("rewrite");

        let events = read_events(&path).expect("read");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let td = tempdir().expect("tempdir");
        let events = read_events(&events_path(td.path())).expect("read");
        assert!(events.is_empty());
    }
}

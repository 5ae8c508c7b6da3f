//! Append-only JSONL event log: the per-task audit trail.
//!
//! Every state transition, submission attempt, and terminal outcome lands in
//! `<scratch>/<task_id>/events.jsonl`, one JSON object per line, flushed as
//! written so a crashed process leaves a complete prefix.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crucible_types::{FailureKind, SubmissionStatus, TaskState};

pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the events file path for a task scratch directory.
pub fn events_path(task_dir: &Path) -> PathBuf {
    task_dir.join(EVENTS_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEventType {
    StateChanged {
        from: TaskState,
        to: TaskState,
    },
    SourcesReady,
    BuildFinished {
        build: String,
        ok: bool,
    },
    CrashAccepted {
        crash_token: String,
        harness: String,
    },
    CrashDuplicate {
        crash_token: String,
    },
    VulnerabilityConfirmed {
        internal_patch_id: String,
    },
    PatchRequested {
        internal_patch_id: String,
        attempt: u32,
    },
    PatchValidated {
        internal_patch_id: String,
        patch_idx: usize,
        passed: bool,
    },
    PovSubmitted {
        internal_patch_id: String,
        competition_pov_id: String,
    },
    PatchSubmitted {
        internal_patch_id: String,
        competition_patch_id: String,
    },
    BundleSubmitted {
        internal_patch_id: String,
        bundle_id: String,
    },
    GradingResult {
        internal_patch_id: String,
        artifact: String,
        status: SubmissionStatus,
    },
    SubmissionsStopped {
        internal_patch_id: String,
        reason: String,
    },
    WorkerFailure {
        component: String,
        kind: FailureKind,
        message: String,
    },
    TaskDeleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    #[serde(flatten)]
    pub event: TaskEventType,
}

/// Handle on one task's event log. Records are appended and flushed
/// immediately.
pub struct EventLog {
    task_id: String,
    file: File,
}

impl EventLog {
    pub fn open(task_dir: &Path, task_id: &str) -> Result<Self> {
        fs::create_dir_all(task_dir)
            .with_context(|| format!("failed to create task dir {}", task_dir.display()))?;
        let path = events_path(task_dir);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        Ok(Self {
            task_id: task_id.to_string(),
            file,
        })
    }

    pub fn record(&mut self, event: TaskEventType) -> Result<()> {
        let entry = TaskEvent {
            timestamp: Utc::now(),
            task_id: self.task_id.clone(),
            event,
        };
        let line = serde_json::to_string(&entry).context("failed to serialize event")?;
        writeln!(self.file, "{}", line).context("failed to write event line")?;
        self.file.flush().context("failed to flush events file")?;
        Ok(())
    }
}

/// Read all events from a task's log. Missing file reads as empty.
pub fn read_events(task_dir: &Path) -> Result<Vec<TaskEvent>> {
    let path = events_path(task_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(&path)
        .with_context(|| format!("failed to open events file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("failed to read event line")?;
        if line.trim().is_empty() {
            continue;
        }
        let event: TaskEvent = serde_json::from_str(&line)
            .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
        events.push(event);
    }
    Ok(events)
}

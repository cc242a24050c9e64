//! Activity log: JSON lines recording what the daemon decided to do.
//!
//! tracing output is for operators watching the daemon live. This file is the
//! durable record of actions taken on a user's behalf: missions reclaimed,
//! hooks run, titles applied. Each line is a self-contained JSON object with
//! an RFC 3339 timestamp, so the log can be grepped or streamed.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// A structured event in the activity log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: ActivityEvent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum ActivityEvent {
    /// The idle reaper stopped a mission and destroyed its slot.
    MissionReclaimed { mission: String, idle_secs: u64 },
    /// A mission was stopped on request.
    MissionStopped { mission: String },
    /// A slot was (re)created for a mission.
    SlotCreated { mission: String, slot: String },
    /// A title was applied to a mission's slot.
    TitleApplied { mission: String, title: String },
    /// A repository sync finished.
    RepoUpdated {
        repo: String,
        before: String,
        after: String,
        changed: bool,
    },
    HookCompleted { repo: String, elapsed_secs: u64 },
    HookFailed {
        repo: String,
        exit_code: Option<i32>,
        stderr: String,
    },
    HookTimedOut { repo: String, timeout_secs: u64 },
}

/// Writer for the activity log.
pub struct ActivityLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ActivityLog {
    /// Open the log at `path`, creating parent directories. Appends to an
    /// existing file.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn log(&self, event: ActivityEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "activity log");

        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    /// Like [`log`](Self::log), for background loops: a failed write is
    /// reported through tracing instead of interrupting the caller.
    pub fn record(&self, event: ActivityEvent) {
        if let Err(e) = self.log(event) {
            warn!(path = %self.path.display(), error = %e, "failed to write activity log");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn entry_serializes_with_tag_and_data() {
        let entry = LogEntry {
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
            event: ActivityEvent::MissionReclaimed {
                mission: "abc12345".to_string(),
                idle_secs: 1801,
            },
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"mission_reclaimed\""));
        assert!(json.contains("\"idle_secs\":1801"));
        assert!(json.contains("\"timestamp\":\"2026-01-01T00:00:00.000Z\""));
    }

    #[test]
    fn write_and_read_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("activity.jsonl");

        let log = ActivityLog::new(&log_path).unwrap();
        log.log(ActivityEvent::TitleApplied {
            mission: "abc12345".to_string(),
            title: "Fixing auth bug".to_string(),
        })
        .unwrap();
        log.record(ActivityEvent::HookFailed {
            repo: "api".to_string(),
            exit_code: Some(2),
            stderr: "boom".to_string(),
        });

        let lines = read_lines(&log_path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "title_applied");
        assert_eq!(lines[0]["data"]["title"], "Fixing auth bug");
        assert_eq!(lines[1]["event"], "hook_failed");
        assert_eq!(lines[1]["data"]["exit_code"], 2);

        let ts = lines[0]["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok(), "bad timestamp {ts}");
    }

    #[test]
    fn creates_parent_directories_and_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("deep").join("nested").join("activity.jsonl");

        {
            let log = ActivityLog::new(&log_path).unwrap();
            log.record(ActivityEvent::MissionStopped {
                mission: "abc12345".to_string(),
            });
        }
        {
            let log = ActivityLog::new(&log_path).unwrap();
            assert_eq!(log.path(), log_path);
            log.record(ActivityEvent::HookTimedOut {
                repo: "api".to_string(),
                timeout_secs: 1800,
            });
        }

        assert_eq!(read_lines(&log_path).len(), 2);
    }
}

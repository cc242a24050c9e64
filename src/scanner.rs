//! Incremental scanner for conversation logs.
//!
//! Logs live at `<missions>/<mission id>/projects/<project>/<session id>.jsonl`
//! and are append-only. Each session row remembers how far its log has been
//! read, so a cycle only touches bytes written since the previous one. Only
//! two record kinds matter here: `custom-title` and `summary`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Sender;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::periodic::CycleReport;
use crate::store::{MissionStore, ScanUpdate, Session};

const LOG_EXTENSION: &str = "jsonl";

/// Raw markers a line must contain before it is worth parsing.
const MARKERS: [&[u8]; 2] = [b"\"custom-title\"", b"\"summary\""];

/// Notification that a mission's derived metadata changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    MetadataChanged { mission_id: String },
}

/// The record kinds this scanner understands; everything else is `Other`.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type")]
enum LogRecord {
    #[serde(rename = "custom-title")]
    CustomTitle {
        #[serde(rename = "customTitle", default)]
        custom_title: String,
    },
    #[serde(rename = "summary")]
    Summary {
        #[serde(default)]
        summary: String,
    },
    #[serde(other)]
    Other,
}

/// Metadata extracted from one pass over new log bytes.
#[derive(Debug, Default, PartialEq)]
struct Extracted {
    custom_title: Option<String>,
    auto_summary: Option<String>,
}

impl Extracted {
    fn observe(&mut self, line: &[u8]) {
        if !MARKERS.iter().any(|marker| contains(line, marker)) {
            return;
        }
        match serde_json::from_slice::<LogRecord>(line) {
            Ok(LogRecord::CustomTitle { custom_title }) => self.custom_title = Some(custom_title),
            Ok(LogRecord::Summary { summary }) => self.auto_summary = Some(summary),
            Ok(LogRecord::Other) => {}
            Err(e) => trace!(error = %e, "skipping malformed log line"),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Stream newline-terminated lines from `reader`, handing each line shorter
/// than `max_line` bytes to `visit`. Longer lines are dropped while streaming
/// and never held in memory whole.
///
/// Returns the number of bytes up to and including the last newline; a
/// trailing partial line is not consumed.
fn read_lines<R: BufRead>(mut reader: R, max_line: usize, mut visit: impl FnMut(&[u8])) -> io::Result<u64> {
    let mut line = Vec::new();
    let mut oversized = false;
    let mut read: u64 = 0;
    let mut complete: u64 = 0;

    loop {
        let chunk = reader.fill_buf()?;
        if chunk.is_empty() {
            return Ok(complete);
        }
        let (taken, newline) = match chunk.iter().position(|&b| b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (chunk.len(), false),
        };
        let body = if newline { &chunk[..taken - 1] } else { chunk };
        if !oversized {
            if line.len() + body.len() > max_line {
                oversized = true;
                line.clear();
            } else {
                line.extend_from_slice(body);
            }
        }
        reader.consume(taken);
        read += taken as u64;

        if newline {
            if !oversized {
                visit(&line);
            }
            line.clear();
            oversized = false;
            complete = read;
        }
    }
}

/// Result of scanning one log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileScan {
    /// Nothing new since the recorded offset.
    Unchanged,
    Scanned { session: String, metadata_changed: bool },
}

pub struct Scanner {
    store: Arc<dyn MissionStore>,
    root: PathBuf,
    max_line_bytes: usize,
    events: Option<Sender<ScanEvent>>,
}

impl Scanner {
    pub fn new(store: Arc<dyn MissionStore>, root: impl Into<PathBuf>, max_line_bytes: usize) -> Self {
        Self {
            store,
            root: root.into(),
            max_line_bytes,
            events: None,
        }
    }

    /// Send a [`ScanEvent`] on `events` whenever a mission's metadata changes.
    pub fn with_events(mut self, events: Sender<ScanEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Every `(mission id, log path)` under the missions root.
    ///
    /// Missing directories are treated as empty; a mission without sessions
    /// has no `projects` directory yet.
    pub fn discover(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut found = Vec::new();
        for mission_dir in list_dir(&self.root)? {
            let Some(name) = mission_dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(mission_id) = parse_mission_id(name) else {
                continue;
            };
            for project in list_dir(&mission_dir.join("projects"))? {
                if !project.is_dir() {
                    continue;
                }
                for log in list_dir(&project)? {
                    if log.extension().and_then(|e| e.to_str()) == Some(LOG_EXTENSION) && log.is_file() {
                        found.push((mission_id.clone(), log));
                    }
                }
            }
        }
        Ok(found)
    }

    /// One full pass over every discovered log.
    pub fn scan_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let logs = match self.discover() {
            Ok(logs) => logs,
            Err(e) => {
                report.fail(self.root.display().to_string(), e);
                return report;
            }
        };

        let mut known: HashMap<String, bool> = HashMap::new();
        for (mission_id, path) in logs {
            let exists = match known.get(&mission_id) {
                Some(exists) => *exists,
                None => match self.store.get_mission(&mission_id) {
                    Ok(mission) => {
                        let exists = mission.is_some();
                        known.insert(mission_id.clone(), exists);
                        exists
                    }
                    Err(e) => {
                        report.fail(path.display().to_string(), e.into());
                        continue;
                    }
                },
            };
            if !exists {
                trace!(mission = %mission_id, "log belongs to unknown mission");
                report.skipped += 1;
                continue;
            }

            match self.scan_file(&mission_id, &path) {
                Ok(FileScan::Unchanged) => report.skipped += 1,
                Ok(FileScan::Scanned { .. }) => report.acted += 1,
                Err(e) => report.fail(path.display().to_string(), e),
            }
        }
        report
    }

    /// Scan the bytes of one log written since its recorded offset.
    pub fn scan_file(&self, mission_id: &str, path: &Path) -> Result<FileScan> {
        let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
            anyhow::bail!("log file name is not valid UTF-8");
        };

        let size = match std::fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileScan::Unchanged),
            Err(e) => return Err(e).with_context(|| format!("failed to stat {}", path.display())),
        };

        let known = self.store.get_session(session_id)?;
        let offset = known.as_ref().map_or(0, |s| s.last_scanned_offset);
        if size <= offset {
            return Ok(FileScan::Unchanged);
        }
        let before = match known {
            Some(session) => session,
            None => self.create_session(session_id, mission_id)?,
        };

        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileScan::Unchanged),
            Err(e) => return Err(e).with_context(|| format!("failed to open {}", path.display())),
        };
        file.seek(SeekFrom::Start(before.last_scanned_offset))
            .with_context(|| format!("failed to seek in {}", path.display()))?;

        let mut extracted = Extracted::default();
        let window = BufReader::new(file.take(size - before.last_scanned_offset));
        let consumed = read_lines(window, self.max_line_bytes, |line| extracted.observe(line))
            .with_context(|| format!("failed to read {}", path.display()))?;
        if consumed == 0 {
            // Only a partial line so far.
            return Ok(FileScan::Unchanged);
        }

        let update = ScanUpdate {
            custom_title: extracted.custom_title,
            auto_summary: extracted.auto_summary,
            offset: before.last_scanned_offset + consumed,
        };
        let after = self.store.update_scan_results(session_id, &update)?;
        let metadata_changed =
            after.custom_title != before.custom_title || after.auto_summary != before.auto_summary;

        debug!(
            session = session_id,
            offset = after.last_scanned_offset,
            changed = metadata_changed,
            "scanned session log"
        );
        if metadata_changed {
            self.notify(mission_id);
        }

        Ok(FileScan::Scanned {
            session: session_id.to_string(),
            metadata_changed,
        })
    }

    fn create_session(&self, session_id: &str, mission_id: &str) -> Result<Session> {
        let session = self.store.create_session(session_id, mission_id)?;
        debug!(session = session_id, mission = %mission_id, "new session discovered");
        Ok(session)
    }

    fn notify(&self, mission_id: &str) {
        let Some(events) = &self.events else { return };
        let event = ScanEvent::MetadataChanged {
            mission_id: mission_id.to_string(),
        };
        if events.send(event).is_err() {
            debug!(mission = %mission_id, "no title reconciler listening");
        }
    }
}

/// Canonical lowercase hyphenated UUID, or `None`.
fn parse_mission_id(name: &str) -> Option<String> {
    let id = Uuid::parse_str(name).ok()?.hyphenated().to_string();
    (id == name).then_some(id)
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to list {}", dir.display())),
    };
    let mut paths = Vec::new();
    for entry in entries {
        match entry {
            Ok(entry) => paths.push(entry.path()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("failed to list {}", dir.display())),
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{NewMission, SqliteStore};
    use proptest::prelude::*;
    use std::fs::{self, OpenOptions};
    use std::io::{Cursor, Write};
    use std::sync::mpsc;

    const MISSION: &str = "6f1c2a4e-8b3d-4c5f-9a7e-1d2b3c4d5e6f";
    const MAX_LINE: usize = 10 * 1024;

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: Arc<SqliteStore>,
        scanner: Scanner,
        log: PathBuf,
        events: mpsc::Receiver<ScanEvent>,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("missions");
        let project = root.join(MISSION).join("projects").join("-home-me-my-project");
        fs::create_dir_all(&project).unwrap();

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store
            .create_mission_with_id(MISSION, &NewMission::default())
            .unwrap();
        let (tx, rx) = mpsc::channel();
        let scanner = Scanner::new(store.clone(), &root, MAX_LINE).with_events(tx);
        Fixture {
            _tmp: tmp,
            store,
            scanner,
            log: project.join("session-1.jsonl"),
            events: rx,
        }
    }

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn title_line(title: &str) -> String {
        format!("{}\n", serde_json::json!({"type": "custom-title", "customTitle": title, "sessionId": "session-1"}))
    }

    fn summary_line(summary: &str) -> String {
        format!("{}\n", serde_json::json!({"type": "summary", "summary": summary, "leafUuid": "x"}))
    }

    fn big_turn(bytes: usize) -> String {
        let filler = "y".repeat(bytes);
        format!("{}\n", serde_json::json!({"type": "assistant", "message": {"content": filler, "note": "summary"}}))
    }

    fn stored(f: &Fixture) -> Session {
        f.store.get_session("session-1").unwrap().unwrap()
    }

    #[test]
    fn log_records_decode_defensively() {
        let title: LogRecord =
            serde_json::from_str(r#"{"type":"custom-title","customTitle":"Auth","extra":1}"#).unwrap();
        assert_eq!(
            title,
            LogRecord::CustomTitle {
                custom_title: "Auth".into()
            }
        );
        let other: LogRecord = serde_json::from_str(r#"{"type":"user","message":"hi"}"#).unwrap();
        assert_eq!(other, LogRecord::Other);
        assert!(serde_json::from_str::<LogRecord>(r#"{"summary":"no type"}"#).is_err());
    }

    #[test]
    fn read_lines_skips_oversized_and_keeps_partial_tail() {
        let input = format!("short\n{}\nafter\npartial", "z".repeat(64));
        let mut seen = Vec::new();
        let consumed = read_lines(Cursor::new(input.as_bytes()), 16, |line| {
            seen.push(String::from_utf8_lossy(line).into_owned())
        })
        .unwrap();
        assert_eq!(seen, vec!["short", "after"]);
        assert_eq!(consumed as usize, input.len() - "partial".len());
    }

    #[test]
    fn read_lines_handles_small_buffers() {
        let input = b"abc\ndefgh\nij\n";
        let mut seen = Vec::new();
        let reader = BufReader::with_capacity(2, Cursor::new(&input[..]));
        let consumed = read_lines(reader, 4, |line| seen.push(line.to_vec())).unwrap();
        assert_eq!(seen, vec![b"abc".to_vec(), b"ij".to_vec()]);
        assert_eq!(consumed, input.len() as u64);
    }

    #[test]
    fn discover_parses_mission_ids_and_ignores_strays() {
        let f = fixture();
        append(&f.log, &title_line("t"));
        let root = f.scanner.root.clone();
        fs::create_dir_all(root.join("not-a-uuid").join("projects").join("p")).unwrap();
        fs::write(root.join("not-a-uuid/projects/p/s.jsonl"), "x\n").unwrap();
        fs::write(f.log.with_file_name("notes.txt"), "x\n").unwrap();
        fs::create_dir_all(root.join("7a7a7a7a-8b3d-4c5f-9a7e-1d2b3c4d5e6f")).unwrap();

        let found = f.scanner.discover().unwrap();
        assert_eq!(found, vec![(MISSION.to_string(), f.log.clone())]);
    }

    #[test]
    fn missing_root_is_empty() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let scanner = Scanner::new(store, "/nonexistent/fleetd/missions", MAX_LINE);
        assert!(scanner.discover().unwrap().is_empty());
        assert!(scanner.scan_cycle().errors.is_empty());
    }

    #[test]
    fn last_write_wins_within_a_pass() {
        let f = fixture();
        append(&f.log, &summary_line("A"));
        append(&f.log, &summary_line("B"));
        append(&f.log, &title_line("first"));
        append(&f.log, &title_line("second"));

        let report = f.scanner.scan_cycle();
        assert_eq!(report.acted, 1);
        let session = stored(&f);
        assert_eq!(session.auto_summary, "B");
        assert_eq!(session.custom_title, "second");
        assert_eq!(session.mission_id, MISSION);
        assert_eq!(
            f.events.try_recv().unwrap(),
            ScanEvent::MetadataChanged {
                mission_id: MISSION.to_string()
            }
        );
    }

    #[test]
    fn empty_region_never_erases_metadata() {
        let f = fixture();
        append(&f.log, &title_line("Keep me"));
        f.scanner.scan_cycle();
        assert!(f.events.try_recv().is_ok());

        append(&f.log, "{\"type\":\"user\",\"message\":\"hello\"}\n");
        append(&f.log, &summary_line(""));
        f.scanner.scan_cycle();

        let session = stored(&f);
        assert_eq!(session.custom_title, "Keep me");
        assert_eq!(session.auto_summary, "");
        assert!(f.events.try_recv().is_err(), "no effective change, no event");
    }

    #[test]
    fn oversized_lines_around_metadata_do_not_hide_it() {
        let f = fixture();
        append(&f.log, &big_turn(20 * 1024));
        append(&f.log, &title_line("Fixing auth bug"));
        append(&f.log, &big_turn(20 * 1024));
        append(&f.log, &summary_line("Auth refactor"));
        append(&f.log, &big_turn(20 * 1024));

        f.scanner.scan_cycle();
        let session = stored(&f);
        assert_eq!(session.custom_title, "Fixing auth bug");
        assert_eq!(session.auto_summary, "Auth refactor");
        assert_eq!(session.last_scanned_offset, fs::metadata(&f.log).unwrap().len());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let f = fixture();
        append(&f.log, "{\"type\":\"custom-title\",\"customTitle\":\n");
        append(&f.log, "{\"type\":\"summary\",\"summary\":42}\n");
        append(&f.log, &summary_line("ok"));

        let report = f.scanner.scan_cycle();
        assert!(report.errors.is_empty());
        assert_eq!(stored(&f).auto_summary, "ok");
    }

    #[test]
    fn partial_trailing_line_is_rescanned_once_complete() {
        let f = fixture();
        let line = title_line("Split write");
        let (head, tail) = line.split_at(10);
        append(&f.log, &summary_line("s"));
        append(&f.log, head);

        f.scanner.scan_cycle();
        let first = stored(&f);
        assert_eq!(first.custom_title, "");
        assert_eq!(first.last_scanned_offset, summary_line("s").len() as u64);

        append(&f.log, tail);
        f.scanner.scan_cycle();
        assert_eq!(stored(&f).custom_title, "Split write");
    }

    #[test]
    fn empty_log_gets_no_session_until_it_has_bytes() {
        let f = fixture();
        append(&f.log, "");

        let report = f.scanner.scan_cycle();
        assert_eq!(report.skipped, 1);
        assert!(f.store.get_session("session-1").unwrap().is_none());

        append(&f.log, &title_line("Now it exists"));
        f.scanner.scan_cycle();
        assert_eq!(stored(&f).custom_title, "Now it exists");
    }

    #[test]
    fn rescanning_without_new_data_is_idempotent() {
        let f = fixture();
        append(&f.log, &title_line("Stable"));
        f.scanner.scan_cycle();
        let first = stored(&f);

        let report = f.scanner.scan_cycle();
        assert_eq!(report.acted, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(stored(&f), first);
    }

    #[test]
    fn logs_of_unknown_missions_are_skipped() {
        let f = fixture();
        let stranger = f
            .scanner
            .root
            .join("7a7a7a7a-8b3d-4c5f-9a7e-1d2b3c4d5e6f")
            .join("projects")
            .join("p");
        fs::create_dir_all(&stranger).unwrap();
        append(&stranger.join("other.jsonl"), &title_line("x"));

        let report = f.scanner.scan_cycle();
        assert!(report.errors.is_empty());
        assert!(f.store.get_session("other").unwrap().is_none());
    }

    fn chunk() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z ]{0,40}".prop_map(|s| s),
            "[a-z]{1,12}".prop_map(|s| title_line(&s)),
            "[a-z]{1,12}".prop_map(|s| summary_line(&s)),
            (1usize..3).prop_map(|k| big_turn(k * 6 * 1024)),
            Just("\n".to_string()),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn offset_is_monotonic_and_bounded(chunks in proptest::collection::vec(chunk(), 1..12)) {
            let f = fixture();
            let mut last = 0u64;
            for piece in &chunks {
                append(&f.log, piece);
                f.scanner.scan_cycle();
                let size = fs::metadata(&f.log).unwrap().len();
                let offset = f
                    .store
                    .get_session("session-1")
                    .unwrap()
                    .map(|s| s.last_scanned_offset)
                    .unwrap_or(0);
                prop_assert!(offset >= last);
                prop_assert!(offset <= size);
                last = offset;
            }

            let before = f.store.get_session("session-1").unwrap();
            f.scanner.scan_cycle();
            prop_assert_eq!(f.store.get_session("session-1").unwrap(), before);
        }
    }
}

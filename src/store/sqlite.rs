//! SQLite-backed [`MissionStore`].
//!
//! All access goes through one connection behind a mutex, which gives the
//! single-writer discipline the daemon's loops rely on.

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Mission, MissionFilter, MissionStatus, MissionStore, NewMission, ScanUpdate, Session,
    StoreError, StoreResult,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS missions (
  id TEXT PRIMARY KEY,
  git_repo TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL DEFAULT 'active',
  slot_handle TEXT,
  process_id INTEGER,
  last_heartbeat INTEGER,
  last_active INTEGER,
  ai_summary TEXT NOT NULL DEFAULT '',
  applied_title TEXT NOT NULL DEFAULT '',
  prompt_count INTEGER NOT NULL DEFAULT 0,
  last_summary_prompt_count INTEGER NOT NULL DEFAULT 0,
  cron_id TEXT,
  cron_name TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_missions_slot ON missions(slot_handle);
CREATE INDEX IF NOT EXISTS idx_missions_cron ON missions(cron_id);

CREATE TABLE IF NOT EXISTS sessions (
  id TEXT PRIMARY KEY,
  mission_id TEXT NOT NULL REFERENCES missions(id) ON DELETE CASCADE,
  custom_title TEXT NOT NULL DEFAULT '',
  auto_summary TEXT NOT NULL DEFAULT '',
  last_scanned_offset INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_mission ON sessions(mission_id, updated_at);
"#;

const MISSION_COLUMNS: &str = "id, git_repo, status, slot_handle, process_id, last_heartbeat, \
     last_active, ai_summary, applied_title, prompt_count, last_summary_prompt_count, \
     cron_id, cron_name, created_at, updated_at";

const SESSION_COLUMNS: &str =
    "id, mission_id, custom_title, auto_summary, last_scanned_offset, created_at, updated_at";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    /// Last timestamp handed out; keeps `updated_at` strictly increasing so
    /// "most recently updated" is well defined within one process.
    last_stamp: AtomicI64,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            last_stamp: AtomicI64::new(0),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stamp(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let prev = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1)
    }

    /// Insert a mission with a caller-chosen id.
    pub fn create_mission_with_id(&self, id: &str, new: &NewMission) -> StoreResult<Mission> {
        let now = self.stamp();
        self.conn().execute(
            "INSERT INTO missions (id, git_repo, status, cron_id, cron_name, created_at, updated_at)
             VALUES (?1, ?2, 'active', ?3, ?4, ?5, ?5)",
            params![id, new.git_repo, new.cron_id, new.cron_name, now],
        )?;
        debug!(mission = id, repo = %new.git_repo, "mission created");
        self.get_mission(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn update_mission(&self, id: &str, sql: &str, value: rusqlite::types::Value) -> StoreResult<()> {
        let now = self.stamp();
        let changed = self.conn().execute(sql, params![id, value, now])?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn row_to_mission(row: &Row) -> rusqlite::Result<Mission> {
        let status: String = row.get(2)?;
        let process_id: Option<i64> = row.get(4)?;
        Ok(Mission {
            id: row.get(0)?,
            git_repo: row.get(1)?,
            status: MissionStatus::parse(&status).unwrap_or_default(),
            slot_handle: row.get(3)?,
            process_id: process_id.and_then(|pid| u32::try_from(pid).ok()),
            last_heartbeat: row.get::<_, Option<i64>>(5)?.map(from_millis),
            last_active: row.get::<_, Option<i64>>(6)?.map(from_millis),
            ai_summary: row.get(7)?,
            applied_title: row.get(8)?,
            prompt_count: to_u32(row.get(9)?),
            last_summary_prompt_count: to_u32(row.get(10)?),
            cron_id: row.get(11)?,
            cron_name: row.get(12)?,
            created_at: from_millis(row.get(13)?),
            updated_at: from_millis(row.get(14)?),
        })
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
        let offset: i64 = row.get(4)?;
        Ok(Session {
            id: row.get(0)?,
            mission_id: row.get(1)?,
            custom_title: row.get(2)?,
            auto_summary: row.get(3)?,
            last_scanned_offset: u64::try_from(offset).unwrap_or(0),
            created_at: from_millis(row.get(5)?),
            updated_at: from_millis(row.get(6)?),
        })
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn is_id_prefix(raw: &str) -> bool {
    raw.chars().all(|c| c.is_ascii_hexdigit() || c == '-')
}

impl MissionStore for SqliteStore {
    fn create_mission(&self, new: &NewMission) -> StoreResult<Mission> {
        let id = Uuid::new_v4().to_string();
        self.create_mission_with_id(&id, new)
    }

    fn get_mission(&self, id: &str) -> StoreResult<Option<Mission>> {
        let sql = format!("SELECT {MISSION_COLUMNS} FROM missions WHERE id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, params![id], Self::row_to_mission)
            .optional()?)
    }

    fn get_by_slot_handle(&self, handle: &str) -> StoreResult<Option<Mission>> {
        let sql = format!(
            "SELECT {MISSION_COLUMNS} FROM missions WHERE slot_handle = ?1
             ORDER BY status = 'active' DESC, updated_at DESC LIMIT 1"
        );
        Ok(self
            .conn()
            .query_row(&sql, params![handle], Self::row_to_mission)
            .optional()?)
    }

    fn list_missions(&self, filter: &MissionFilter) -> StoreResult<Vec<Mission>> {
        let sql = format!(
            "SELECT {MISSION_COLUMNS} FROM missions
             WHERE (?1 OR status = 'active') AND (?2 IS NULL OR cron_id = ?2)
             ORDER BY created_at DESC"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let missions = stmt
            .query_map(
                params![filter.include_archived, filter.cron_id],
                Self::row_to_mission,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(missions)
    }

    fn resolve_short_id(&self, prefix: &str) -> StoreResult<String> {
        let prefix = prefix.trim().to_ascii_lowercase();
        if prefix.is_empty() || !is_id_prefix(&prefix) {
            return Err(StoreError::NotFound(prefix));
        }

        let conn = self.conn();
        let exact: Option<String> = conn
            .query_row(
                "SELECT id FROM missions WHERE id = ?1",
                params![prefix],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = exact {
            return Ok(id);
        }

        let mut stmt = conn.prepare("SELECT id FROM missions WHERE id LIKE ?1 ORDER BY id")?;
        let mut candidates = stmt
            .query_map(params![format!("{prefix}%")], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        match candidates.len() {
            0 => Err(StoreError::NotFound(prefix)),
            1 => Ok(candidates.remove(0)),
            _ => Err(StoreError::Ambiguous { prefix, candidates }),
        }
    }

    fn set_heartbeat(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.update_mission(
            id,
            "UPDATE missions SET last_heartbeat = ?2, updated_at = ?3 WHERE id = ?1",
            at.timestamp_millis().into(),
        )
    }

    fn set_last_active(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        self.update_mission(
            id,
            "UPDATE missions SET last_active = ?2, updated_at = ?3 WHERE id = ?1",
            at.timestamp_millis().into(),
        )
    }

    fn set_slot_handle(&self, id: &str, handle: Option<&str>) -> StoreResult<()> {
        let now = self.stamp();
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        if let Some(handle) = handle {
            // The pool just handed this pane out, so any other holder is a
            // leftover from a tmux server that has since restarted.
            let released = tx.execute(
                "UPDATE missions SET slot_handle = NULL, applied_title = '', updated_at = ?3
                 WHERE slot_handle = ?1 AND status = 'active' AND id != ?2",
                params![handle, id, now],
            )?;
            if released > 0 {
                warn!(slot = handle, released, "released stale slot handle held by another mission");
            }
        }
        // The applied title describes one window; a different slot starts over.
        let changed = tx.execute(
            "UPDATE missions SET
               applied_title = CASE WHEN slot_handle IS ?2 THEN applied_title ELSE '' END,
               slot_handle = ?2,
               updated_at = ?3
             WHERE id = ?1",
            params![id, handle, now],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        tx.commit()?;
        Ok(())
    }

    fn set_process_id(&self, id: &str, pid: Option<u32>) -> StoreResult<()> {
        let value = match pid {
            Some(pid) => rusqlite::types::Value::Integer(i64::from(pid)),
            None => rusqlite::types::Value::Null,
        };
        self.update_mission(
            id,
            "UPDATE missions SET process_id = ?2, updated_at = ?3 WHERE id = ?1",
            value,
        )
    }

    fn increment_prompt_count(&self, id: &str) -> StoreResult<u32> {
        let now = self.stamp();
        let count: Option<i64> = self
            .conn()
            .query_row(
                "UPDATE missions SET prompt_count = prompt_count + 1, updated_at = ?2
                 WHERE id = ?1 RETURNING prompt_count",
                params![id, now],
                |row| row.get(0),
            )
            .optional()?;
        count
            .map(to_u32)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn set_ai_summary(&self, id: &str, summary: &str, at_prompt_count: u32) -> StoreResult<()> {
        let now = self.stamp();
        let changed = self.conn().execute(
            "UPDATE missions SET ai_summary = ?2, last_summary_prompt_count = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, summary, at_prompt_count, now],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn set_applied_title(&self, id: &str, title: &str) -> StoreResult<()> {
        self.update_mission(
            id,
            "UPDATE missions SET applied_title = ?2, updated_at = ?3 WHERE id = ?1",
            title.to_string().into(),
        )
    }

    fn archive_mission(&self, id: &str) -> StoreResult<()> {
        self.update_mission(
            id,
            "UPDATE missions SET status = ?2, updated_at = ?3 WHERE id = ?1",
            MissionStatus::Archived.as_str().to_string().into(),
        )
    }

    fn delete_mission(&self, id: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM sessions WHERE mission_id = ?1", params![id])?;
        let changed = tx.execute("DELETE FROM missions WHERE id = ?1", params![id])?;
        tx.commit()?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn create_session(&self, session_id: &str, mission_id: &str) -> StoreResult<Session> {
        let now = self.stamp();
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO sessions (id, mission_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![session_id, mission_id, now],
        )?;
        if inserted > 0 {
            debug!(session = session_id, mission = mission_id, "session created");
        }
        self.get_session(session_id)?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, params![session_id], Self::row_to_session)
            .optional()?)
    }

    fn list_sessions_by_mission(&self, mission_id: &str) -> StoreResult<Vec<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE mission_id = ?1
             ORDER BY updated_at DESC"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let sessions = stmt
            .query_map(params![mission_id], Self::row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    fn get_active_session(&self, mission_id: &str) -> StoreResult<Option<Session>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE mission_id = ?1
             ORDER BY updated_at DESC LIMIT 1"
        );
        Ok(self
            .conn()
            .query_row(&sql, params![mission_id], Self::row_to_session)
            .optional()?)
    }

    fn update_scan_results(&self, session_id: &str, update: &ScanUpdate) -> StoreResult<Session> {
        let now = self.stamp();
        let offset = i64::try_from(update.offset)
            .map_err(|_| StoreError::Corrupt(format!("offset {} overflows", update.offset)))?;
        let changed = self.conn().execute(
            "UPDATE sessions SET
               custom_title = COALESCE(NULLIF(?2, ''), custom_title),
               auto_summary = COALESCE(NULLIF(?3, ''), auto_summary),
               last_scanned_offset = MAX(last_scanned_offset, ?4),
               updated_at = ?5
             WHERE id = ?1",
            params![
                session_id,
                update.custom_title,
                update.auto_summary,
                offset,
                now
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(session_id.to_string()));
        }
        self.get_session(session_id)?
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }
}

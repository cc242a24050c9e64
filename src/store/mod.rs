//! Mission and session records.
//!
//! The store is the single source of truth for mission/session state. Loops
//! and commands only see the [`MissionStore`] trait; [`SqliteStore`] is the
//! production implementation.

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Length of the short id derived from a mission's full id.
pub const SHORT_ID_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no mission matches '{0}'")]
    NotFound(String),
    #[error("'{prefix}' is ambiguous; candidates: {}", .candidates.join(", "))]
    Ambiguous {
        prefix: String,
        candidates: Vec<String>,
    },
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MissionStatus {
    #[default]
    Active,
    Archived,
}

impl MissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MissionStatus::Active => "active",
            MissionStatus::Archived => "archived",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(MissionStatus::Active),
            "archived" => Some(MissionStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mission {
    pub id: String,
    pub git_repo: String,
    pub status: MissionStatus,
    /// tmux pane id of the pooled slot currently running this mission.
    pub slot_handle: Option<String>,
    /// Process id of the agent wrapper, used as the liveness probe.
    pub process_id: Option<u32>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub ai_summary: String,
    /// Last title this daemon applied to the slot. Empty until the first apply.
    pub applied_title: String,
    pub prompt_count: u32,
    pub last_summary_prompt_count: u32,
    pub cron_id: Option<String>,
    pub cron_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mission {
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// First [`SHORT_ID_LEN`] characters of a mission id.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewMission {
    pub git_repo: String,
    pub cron_id: Option<String>,
    pub cron_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MissionFilter {
    pub include_archived: bool,
    pub cron_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Base name of the conversation log file.
    pub id: String,
    pub mission_id: String,
    pub custom_title: String,
    pub auto_summary: String,
    pub last_scanned_offset: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of one scan pass over a session log.
///
/// `None` (or an empty string) leaves the stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct ScanUpdate {
    pub custom_title: Option<String>,
    pub auto_summary: Option<String>,
    pub offset: u64,
}

pub trait MissionStore: Send + Sync {
    fn create_mission(&self, new: &NewMission) -> StoreResult<Mission>;
    fn get_mission(&self, id: &str) -> StoreResult<Option<Mission>>;
    fn get_by_slot_handle(&self, handle: &str) -> StoreResult<Option<Mission>>;
    fn list_missions(&self, filter: &MissionFilter) -> StoreResult<Vec<Mission>>;

    /// Resolve a full id or a short-id prefix to exactly one mission id.
    fn resolve_short_id(&self, prefix: &str) -> StoreResult<String>;

    fn set_heartbeat(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;
    fn set_last_active(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;
    /// Record the mission's slot. A handle held by another active mission is
    /// taken from it, and a changed handle clears the applied title.
    fn set_slot_handle(&self, id: &str, handle: Option<&str>) -> StoreResult<()>;
    fn set_process_id(&self, id: &str, pid: Option<u32>) -> StoreResult<()>;
    /// Returns the new prompt count.
    fn increment_prompt_count(&self, id: &str) -> StoreResult<u32>;
    fn set_ai_summary(&self, id: &str, summary: &str, at_prompt_count: u32) -> StoreResult<()>;
    fn set_applied_title(&self, id: &str, title: &str) -> StoreResult<()>;
    fn archive_mission(&self, id: &str) -> StoreResult<()>;
    /// Removes the mission and all of its sessions.
    fn delete_mission(&self, id: &str) -> StoreResult<()>;

    fn create_session(&self, session_id: &str, mission_id: &str) -> StoreResult<Session>;
    fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>>;
    fn list_sessions_by_mission(&self, mission_id: &str) -> StoreResult<Vec<Session>>;
    /// Most recently updated session of the mission.
    fn get_active_session(&self, mission_id: &str) -> StoreResult<Option<Session>>;
    fn update_scan_results(&self, session_id: &str, update: &ScanUpdate) -> StoreResult<Session>;
}

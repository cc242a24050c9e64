//! Pooled execution slots.
//!
//! Every running mission owns one tmux window inside a shared pool session.
//! Being *in* the pool means the mission is running; being *linked* into some
//! other session means a human is looking at it. The reaper relies on that
//! distinction, so it is the only view of tmux the rest of the daemon gets.

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::store::short_id;
use crate::tmux::{Tmux, WindowRow};

/// Window option carrying the owning mission's short id. Window names are
/// display state (the title reconciler rewrites them), so identity lives here.
pub const MISSION_TAG_OPTION: &str = "@fleet_mission";

/// Name of the placeholder window that keeps the pool session alive while no
/// mission is running.
const PLACEHOLDER_WINDOW: &str = "_pool";

/// Lifecycle of pooled slots. Methods taking a `mission_id` accept the full id
/// and key the slot by its short id.
pub trait Pool: Send + Sync {
    /// Create the pool session if it does not exist. Idempotent.
    fn ensure_pool(&self) -> Result<()>;
    /// Start `command` in a new slot for the mission; returns the slot handle.
    fn create_slot(&self, mission_id: &str, command: &str) -> Result<String>;
    /// Show the slot in `target_view` next to its current window, without
    /// switching to it. Linking an already linked slot is an error.
    fn link(&self, slot_handle: &str, target_view: &str) -> Result<()>;
    /// Remove the slot from `target_view`; it keeps running in the pool.
    fn unlink(&self, target_view: &str, mission_id: &str) -> Result<()>;
    /// Kill the slot. Never fails: a missing slot is already destroyed.
    fn destroy(&self, mission_id: &str);
    fn slot_exists(&self, mission_id: &str) -> Result<bool>;
    /// Short ids of every slot in the pool.
    fn list_pool_slot_ids(&self) -> Result<Vec<String>>;
    /// Short ids of slots linked into at least one session besides the pool.
    fn linked_elsewhere_ids(&self) -> Result<HashSet<String>>;
    /// Short ids of slots currently linked into `view`.
    fn linked_into(&self, view: &str) -> Result<HashSet<String>>;
}

/// Display surface of a slot, used by the title reconciler.
pub trait SlotDisplay: Send + Sync {
    /// Number of panes in the slot's window.
    fn pane_count(&self, slot_handle: &str) -> Result<usize>;
    /// Name currently shown for the slot's window.
    fn window_name(&self, slot_handle: &str) -> Result<String>;
    fn rename(&self, slot_handle: &str, title: &str) -> Result<()>;
}

/// [`Pool`] backed by a tmux session.
pub struct TmuxPool {
    tmux: Tmux,
    session: String,
    ensure_lock: Mutex<()>,
}

impl TmuxPool {
    pub fn new(tmux: Tmux, session: impl Into<String>) -> Self {
        Self {
            tmux,
            session: session.into(),
            ensure_lock: Mutex::new(()),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    fn windows(&self) -> Result<Vec<WindowRow>> {
        self.tmux.list_windows_all(MISSION_TAG_OPTION)
    }

    /// Window id of the mission's slot inside the pool session.
    fn find_window(&self, short: &str) -> Result<Option<String>> {
        Ok(self
            .windows()?
            .into_iter()
            .find(|row| row.session == self.session && row.tag == short)
            .map(|row| row.window_id))
    }
}

impl Pool for TmuxPool {
    fn ensure_pool(&self) -> Result<()> {
        let _guard = self.ensure_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.tmux.has_session(&self.session) {
            return Ok(());
        }
        match self.tmux.new_session(&self.session, PLACEHOLDER_WINDOW) {
            Ok(()) => {
                info!(session = %self.session, "pool session created");
                Ok(())
            }
            // Another process may have won the race; that is fine.
            Err(_) if self.tmux.has_session(&self.session) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn create_slot(&self, mission_id: &str, command: &str) -> Result<String> {
        self.ensure_pool()?;
        let short = short_id(mission_id);
        if let Some(window) = self.find_window(short)? {
            bail!("slot for mission {short} already exists in pool ({window})");
        }

        let pane = self.tmux.new_window(&self.session, short, command)?;
        if let Err(e) = self.tmux.set_window_option(&pane, MISSION_TAG_OPTION, short) {
            // An untagged window is invisible to the pool; do not leave it behind.
            let _ = self.tmux.kill_window(&pane);
            return Err(e);
        }
        info!(mission = short, pane = %pane, "slot created");
        Ok(pane)
    }

    fn link(&self, slot_handle: &str, target_view: &str) -> Result<()> {
        let target = format!("={target_view}:");
        self.tmux.link_window(slot_handle, &target)?;
        debug!(slot = slot_handle, view = target_view, "slot linked");
        Ok(())
    }

    fn unlink(&self, target_view: &str, mission_id: &str) -> Result<()> {
        let short = short_id(mission_id);
        let Some(window) = self.find_window(short)? else {
            bail!("no slot for mission {short} in pool");
        };
        self.tmux.unlink_window(&format!("={target_view}:{window}"))?;
        debug!(mission = short, view = target_view, "slot unlinked");
        Ok(())
    }

    fn destroy(&self, mission_id: &str) {
        let short = short_id(mission_id);
        let window = match self.find_window(short) {
            Ok(Some(window)) => window,
            Ok(None) => {
                debug!(mission = short, "slot already gone");
                return;
            }
            Err(e) => {
                warn!(mission = short, error = %e, "failed to look up slot for destroy");
                return;
            }
        };
        match self.tmux.kill_window(&window) {
            Ok(()) => info!(mission = short, "slot destroyed"),
            Err(e) => warn!(mission = short, error = %e, "failed to destroy slot"),
        }
    }

    fn slot_exists(&self, mission_id: &str) -> Result<bool> {
        Ok(self.find_window(short_id(mission_id))?.is_some())
    }

    fn list_pool_slot_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .windows()?
            .into_iter()
            .filter(|row| row.session == self.session && !row.tag.is_empty())
            .map(|row| row.tag)
            .collect())
    }

    fn linked_elsewhere_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .windows()?
            .into_iter()
            .filter(|row| row.session != self.session && !row.tag.is_empty())
            .map(|row| row.tag)
            .collect())
    }

    fn linked_into(&self, view: &str) -> Result<HashSet<String>> {
        Ok(self
            .windows()?
            .into_iter()
            .filter(|row| row.session == view && !row.tag.is_empty())
            .map(|row| row.tag)
            .collect())
    }
}

impl SlotDisplay for TmuxPool {
    fn pane_count(&self, slot_handle: &str) -> Result<usize> {
        let raw = self.tmux.display(slot_handle, "#{window_panes}")?;
        raw.trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("unexpected window_panes value '{raw}': {e}"))
    }

    fn window_name(&self, slot_handle: &str) -> Result<String> {
        self.tmux.display(slot_handle, "#{window_name}")
    }

    fn rename(&self, slot_handle: &str, title: &str) -> Result<()> {
        self.tmux.rename_window(slot_handle, title)
    }
}

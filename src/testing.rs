//! In-memory stand-ins for tmux, mission processes, git and config, shared by
//! the loop tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};
use chrono::Utc;

use crate::config::{ConfigSource, DaemonConfig};
use crate::pool::{Pool, SlotDisplay};
use crate::repo_update::GitOps;
use crate::runner::MissionRunner;
use crate::store::{Mission, MissionStatus, short_id};

pub const MISSION_ID: &str = "abc12345-0000-4000-8000-000000000001";

/// A mission value with test defaults, adjusted by `edit`.
pub fn mission_with(edit: impl FnOnce(&mut Mission)) -> Mission {
    let now = Utc::now();
    let mut mission = Mission {
        id: MISSION_ID.to_string(),
        git_repo: "github.com/owner/my-project".to_string(),
        status: MissionStatus::Active,
        slot_handle: None,
        process_id: None,
        last_heartbeat: None,
        last_active: None,
        ai_summary: String::new(),
        applied_title: String::new(),
        prompt_count: 0,
        last_summary_prompt_count: 0,
        cron_id: None,
        cron_name: None,
        created_at: now,
        updated_at: now,
    };
    edit(&mut mission);
    mission
}

#[derive(Debug, Clone)]
pub struct FakeSlot {
    pub handle: String,
    pub name: String,
    pub panes: usize,
    pub views: HashSet<String>,
}

#[derive(Debug, Default)]
struct FakePoolState {
    ensured: bool,
    next_pane: u32,
    slots: HashMap<String, FakeSlot>,
    destroyed: Vec<String>,
    renames: Vec<(String, String)>,
    fail_rename: bool,
}

/// [`Pool`] and [`SlotDisplay`] over a map of slots keyed by short id.
#[derive(Debug, Default)]
pub struct FakePool {
    state: Mutex<FakePoolState>,
}

impl FakePool {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakePoolState> {
        self.state.lock().unwrap()
    }

    /// Insert a running slot without going through `create_slot`.
    pub fn add_slot(&self, mission_id: &str, handle: &str) {
        let short = short_id(mission_id).to_string();
        self.state().slots.insert(
            short.clone(),
            FakeSlot {
                handle: handle.to_string(),
                name: short,
                panes: 1,
                views: HashSet::new(),
            },
        );
    }

    pub fn slot(&self, mission_id: &str) -> Option<FakeSlot> {
        self.state().slots.get(short_id(mission_id)).cloned()
    }

    pub fn set_panes(&self, mission_id: &str, panes: usize) {
        if let Some(slot) = self.state().slots.get_mut(short_id(mission_id)) {
            slot.panes = panes;
        }
    }

    /// Rename as a user would, bypassing the reconciler.
    pub fn user_rename(&self, mission_id: &str, name: &str) {
        if let Some(slot) = self.state().slots.get_mut(short_id(mission_id)) {
            slot.name = name.to_string();
        }
    }

    pub fn set_fail_rename(&self, fail: bool) {
        self.state().fail_rename = fail;
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state().destroyed.clone()
    }

    pub fn renames(&self) -> Vec<(String, String)> {
        self.state().renames.clone()
    }

    fn by_handle<'a>(state: &'a mut FakePoolState, handle: &str) -> Result<&'a mut FakeSlot> {
        state
            .slots
            .values_mut()
            .find(|slot| slot.handle == handle)
            .ok_or_else(|| anyhow!("can't find pane: {handle}"))
    }
}

impl Pool for FakePool {
    fn ensure_pool(&self) -> Result<()> {
        self.state().ensured = true;
        Ok(())
    }

    fn create_slot(&self, mission_id: &str, _command: &str) -> Result<String> {
        let mut state = self.state();
        state.ensured = true;
        let short = short_id(mission_id).to_string();
        if state.slots.contains_key(&short) {
            bail!("slot for mission {short} already exists in pool");
        }
        state.next_pane += 1;
        let handle = format!("%{}", state.next_pane);
        state.slots.insert(
            short.clone(),
            FakeSlot {
                handle: handle.clone(),
                name: short,
                panes: 1,
                views: HashSet::new(),
            },
        );
        Ok(handle)
    }

    fn link(&self, slot_handle: &str, target_view: &str) -> Result<()> {
        let mut state = self.state();
        let slot = Self::by_handle(&mut state, slot_handle)?;
        if !slot.views.insert(target_view.to_string()) {
            bail!("{slot_handle} is already linked into {target_view}");
        }
        Ok(())
    }

    fn unlink(&self, target_view: &str, mission_id: &str) -> Result<()> {
        let mut state = self.state();
        let short = short_id(mission_id);
        let Some(slot) = state.slots.get_mut(short) else {
            bail!("no slot for mission {short} in pool");
        };
        if !slot.views.remove(target_view) {
            bail!("slot {short} is not linked into {target_view}");
        }
        Ok(())
    }

    fn destroy(&self, mission_id: &str) {
        let mut state = self.state();
        let short = short_id(mission_id).to_string();
        state.slots.remove(&short);
        state.destroyed.push(short);
    }

    fn slot_exists(&self, mission_id: &str) -> Result<bool> {
        Ok(self.state().slots.contains_key(short_id(mission_id)))
    }

    fn list_pool_slot_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.state().slots.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn linked_elsewhere_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .state()
            .slots
            .iter()
            .filter(|(_, slot)| !slot.views.is_empty())
            .map(|(short, _)| short.clone())
            .collect())
    }

    fn linked_into(&self, view: &str) -> Result<HashSet<String>> {
        Ok(self
            .state()
            .slots
            .iter()
            .filter(|(_, slot)| slot.views.contains(view))
            .map(|(short, _)| short.clone())
            .collect())
    }
}

impl SlotDisplay for FakePool {
    fn pane_count(&self, slot_handle: &str) -> Result<usize> {
        let mut state = self.state();
        Ok(Self::by_handle(&mut state, slot_handle)?.panes)
    }

    fn window_name(&self, slot_handle: &str) -> Result<String> {
        let mut state = self.state();
        Ok(Self::by_handle(&mut state, slot_handle)?.name.clone())
    }

    fn rename(&self, slot_handle: &str, title: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_rename {
            bail!("rename-window failed: server exited");
        }
        Self::by_handle(&mut state, slot_handle)?.name = title.to_string();
        state
            .renames
            .push((slot_handle.to_string(), title.to_string()));
        Ok(())
    }
}

/// [`MissionRunner`] whose running set is controlled by the test.
#[derive(Debug, Default)]
pub struct FakeRunner {
    running: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    stopped: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self, mission_id: &str) {
        self.running.lock().unwrap().insert(mission_id.to_string());
    }

    pub fn fail_stop(&self, mission_id: &str) {
        self.failing.lock().unwrap().insert(mission_id.to_string());
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

impl MissionRunner for FakeRunner {
    fn is_running(&self, mission: &Mission) -> bool {
        self.running.lock().unwrap().contains(&mission.id)
    }

    fn stop(&self, mission: &Mission) -> Result<()> {
        if self.failing.lock().unwrap().contains(&mission.id) {
            bail!("permission denied signalling {}", mission.short_id());
        }
        self.running.lock().unwrap().remove(&mission.id);
        self.stopped.lock().unwrap().push(mission.id.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct FakeRepo {
    head: String,
    remote_head: String,
}

/// [`GitOps`] where each repository has a local and a remote head; `sync`
/// copies the remote head to the local one.
#[derive(Debug, Default)]
pub struct FakeGit {
    repos: Mutex<HashMap<PathBuf, FakeRepo>>,
    calls: Mutex<Vec<String>>,
    fail_sync: Mutex<HashSet<PathBuf>>,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_heads(&self, repo: &Path, local: &str, remote: &str) {
        self.repos.lock().unwrap().insert(
            repo.to_path_buf(),
            FakeRepo {
                head: local.to_string(),
                remote_head: remote.to_string(),
            },
        );
    }

    pub fn fail_sync(&self, repo: &Path) {
        self.fail_sync.lock().unwrap().insert(repo.to_path_buf());
    }

    /// Operations performed so far, as `"<op> <repo dir name>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, op: &str, repo: &Path) {
        let name = repo
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(format!("{op} {name}"));
    }
}

impl GitOps for FakeGit {
    fn head(&self, repo: &Path) -> Result<String> {
        self.record("head", repo);
        Ok(self
            .repos
            .lock()
            .unwrap()
            .get(repo)
            .map(|r| r.head.clone())
            .unwrap_or_default())
    }

    fn refresh_default_branch(&self, repo: &Path) -> Result<()> {
        self.record("refresh", repo);
        Ok(())
    }

    fn sync(&self, repo: &Path) -> Result<()> {
        self.record("sync", repo);
        if self.fail_sync.lock().unwrap().contains(repo) {
            bail!("fetch failed: could not resolve host");
        }
        if let Some(r) = self.repos.lock().unwrap().get_mut(repo) {
            r.head = r.remote_head.clone();
        }
        Ok(())
    }

    fn gc(&self, repo: &Path) -> Result<()> {
        self.record("gc", repo);
        Ok(())
    }
}

/// [`ConfigSource`] returning whatever the test last stored.
#[derive(Debug, Default)]
pub struct StaticConfig {
    config: Mutex<DaemonConfig>,
}

impl StaticConfig {
    pub fn new(config: DaemonConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }

    pub fn replace(&self, config: DaemonConfig) {
        *self.config.lock().unwrap() = config;
    }
}

impl ConfigSource for StaticConfig {
    fn load(&self) -> Result<DaemonConfig> {
        Ok(self.config.lock().unwrap().clone())
    }
}

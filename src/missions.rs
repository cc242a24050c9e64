//! Mission commands: the operations an attach/stop request maps to.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::log::{ActivityEvent, ActivityLog};
use crate::pool::Pool;
use crate::runner::MissionRunner;
use crate::store::{Mission, MissionStatus, MissionStore, StoreError};

/// Environment variable telling the agent wrapper which mission it runs.
pub const MISSION_ID_ENV: &str = "FLEETD_MISSION_ID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOutcome {
    pub mission_id: String,
    pub slot_handle: String,
    /// A new slot had to be started.
    pub created: bool,
    /// The slot was linked into the view by this call.
    pub linked: bool,
}

pub struct Missions {
    store: Arc<dyn MissionStore>,
    pool: Arc<dyn Pool>,
    runner: Arc<dyn MissionRunner>,
    agent_command: String,
    activity: Option<Arc<ActivityLog>>,
}

impl Missions {
    pub fn new(
        store: Arc<dyn MissionStore>,
        pool: Arc<dyn Pool>,
        runner: Arc<dyn MissionRunner>,
        agent_command: impl Into<String>,
    ) -> Self {
        Self {
            store,
            pool,
            runner,
            agent_command: agent_command.into(),
            activity: None,
        }
    }

    pub fn with_activity_log(mut self, activity: Arc<ActivityLog>) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Resolve a full id or short-id prefix to its mission.
    pub fn resolve(&self, id_or_prefix: &str) -> Result<Mission> {
        let id = self.store.resolve_short_id(id_or_prefix)?;
        let mission = self
            .store
            .get_mission(&id)?
            .ok_or(StoreError::NotFound(id))?;
        Ok(mission)
    }

    fn slot_command(&self, mission: &Mission) -> String {
        format!("{MISSION_ID_ENV}={} {}", mission.id, self.agent_command)
    }

    /// Make the mission visible in `view`, restarting its slot if it was
    /// reclaimed or never started.
    pub fn attach(&self, id_or_prefix: &str, view: &str) -> Result<AttachOutcome> {
        let mission = self.resolve(id_or_prefix)?;
        if mission.status == MissionStatus::Archived {
            bail!("mission {} is archived", mission.short_id());
        }

        let live = self.pool.slot_exists(&mission.id)?;
        let (handle, created) = match (mission.slot_handle.clone(), live) {
            (Some(handle), true) => (handle, false),
            (recorded, live) => {
                if live {
                    // Running but untracked; we cannot address it, so start over.
                    warn!(mission = mission.short_id(), "replacing untracked slot");
                    self.pool.destroy(&mission.id);
                } else if let Some(stale) = recorded {
                    debug!(mission = mission.short_id(), slot = %stale, "recorded slot is gone");
                }
                let handle = self
                    .pool
                    .create_slot(&mission.id, &self.slot_command(&mission))
                    .with_context(|| format!("failed to start mission {}", mission.short_id()))?;
                if let Err(e) = self.store.set_slot_handle(&mission.id, Some(&handle)) {
                    self.pool.destroy(&mission.id);
                    return Err(e).context("failed to record slot handle");
                }
                info!(mission = mission.short_id(), slot = %handle, "slot started");
                self.record(ActivityEvent::SlotCreated {
                    mission: mission.short_id().to_string(),
                    slot: handle.clone(),
                });
                (handle, true)
            }
        };

        let linked = if self.pool.linked_into(view)?.contains(mission.short_id()) {
            false
        } else {
            self.pool
                .link(&handle, view)
                .with_context(|| format!("failed to show mission {} in {view}", mission.short_id()))?;
            true
        };
        self.store.set_last_active(&mission.id, Utc::now())?;

        Ok(AttachOutcome {
            mission_id: mission.id,
            slot_handle: handle,
            created,
            linked,
        })
    }

    /// Hide the mission from `view`; it keeps running in the pool.
    pub fn detach(&self, id_or_prefix: &str, view: &str) -> Result<()> {
        let mission = self.resolve(id_or_prefix)?;
        if !self.pool.linked_into(view)?.contains(mission.short_id()) {
            debug!(mission = mission.short_id(), view, "not linked; nothing to detach");
            return Ok(());
        }
        self.pool.unlink(view, &mission.id)
    }

    /// Stop the mission's process and destroy its slot. The mission stays
    /// active and restarts on the next attach.
    pub fn stop(&self, id_or_prefix: &str) -> Result<Mission> {
        let mission = self.resolve(id_or_prefix)?;
        self.runner
            .stop(&mission)
            .with_context(|| format!("failed to stop mission {}", mission.short_id()))?;
        self.pool.destroy(&mission.id);
        self.store.set_slot_handle(&mission.id, None)?;
        self.store.set_process_id(&mission.id, None)?;
        info!(mission = mission.short_id(), "mission stopped");
        self.record(ActivityEvent::MissionStopped {
            mission: mission.short_id().to_string(),
        });
        Ok(mission)
    }

    /// Stop the mission if it is running and hide it from default listings.
    pub fn archive(&self, id_or_prefix: &str) -> Result<Mission> {
        let mission = self.stop(id_or_prefix)?;
        self.store.archive_mission(&mission.id)?;
        Ok(mission)
    }

    fn record(&self, event: ActivityEvent) {
        if let Some(activity) = &self.activity {
            activity.record(event);
        }
    }
}

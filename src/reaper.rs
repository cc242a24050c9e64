//! Idle reaper: stops missions nobody has touched for a while.
//!
//! Idle time is measured from the mission's own liveness columns
//! (last-active, then last-heartbeat, then creation time), whichever is
//! freshest. Conversation-log modification times are not consulted.
//! Reclaiming stops the process and destroys the slot; the mission row stays
//! active so the next attach restarts it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::log::{ActivityEvent, ActivityLog};
use crate::periodic::CycleReport;
use crate::pool::Pool;
use crate::runner::MissionRunner;
use crate::store::{Mission, MissionFilter, MissionStore};

pub struct Reaper {
    store: Arc<dyn MissionStore>,
    pool: Arc<dyn Pool>,
    runner: Arc<dyn MissionRunner>,
    activity: Option<Arc<ActivityLog>>,
    threshold: Duration,
}

/// Most recent liveness signal of a mission.
pub fn freshest_signal(mission: &Mission) -> DateTime<Utc> {
    [mission.last_active, mission.last_heartbeat]
        .into_iter()
        .flatten()
        .fold(mission.created_at, |acc, at| acc.max(at))
}

/// Time since the freshest liveness signal. Signals in the future count as
/// zero idle time.
pub fn idle_duration(mission: &Mission, now: DateTime<Utc>) -> Duration {
    (now - freshest_signal(mission)).to_std().unwrap_or_default()
}

impl Reaper {
    pub fn new(
        store: Arc<dyn MissionStore>,
        pool: Arc<dyn Pool>,
        runner: Arc<dyn MissionRunner>,
        threshold: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            runner,
            activity: None,
            threshold,
        }
    }

    pub fn with_activity_log(mut self, activity: Arc<ActivityLog>) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Evaluate every active mission once.
    pub fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();

        let missions = match self.store.list_missions(&MissionFilter::default()) {
            Ok(missions) => missions,
            Err(e) => {
                report.fail("missions", anyhow::Error::new(e).context("failed to list missions"));
                return report;
            }
        };

        let mut watched = None;
        for mission in &missions {
            if !self.runner.is_running(mission) {
                continue;
            }

            let idle = idle_duration(mission, now);
            if idle <= self.threshold {
                report.skipped += 1;
                continue;
            }

            // Only ask tmux once a mission is actually eligible.
            if watched.is_none() {
                match self.pool.linked_elsewhere_ids() {
                    Ok(ids) => watched = Some(ids),
                    Err(e) => {
                        // Without visibility we could reclaim something a human
                        // is looking at; sit this cycle out.
                        report.fail("pool", e.context("failed to list linked slots"));
                        return report;
                    }
                }
            }
            if watched
                .as_ref()
                .is_some_and(|ids| ids.contains(mission.short_id()))
            {
                debug!(
                    mission = mission.short_id(),
                    idle_secs = idle.as_secs(),
                    "idle mission is linked into a view; not reclaiming"
                );
                report.skipped += 1;
                continue;
            }

            match self.reclaim(mission, idle) {
                Ok(()) => report.acted += 1,
                Err(e) => report.fail(mission.short_id(), e),
            }
        }

        report
    }

    fn reclaim(&self, mission: &Mission, idle: Duration) -> Result<()> {
        self.runner
            .stop(mission)
            .context("failed to stop idle mission")?;
        self.pool.destroy(&mission.id);
        self.store
            .set_slot_handle(&mission.id, None)
            .context("failed to clear slot handle")?;
        self.store
            .set_process_id(&mission.id, None)
            .context("failed to clear process id")?;

        info!(
            mission = mission.short_id(),
            idle_secs = idle.as_secs(),
            "reclaimed idle mission"
        );
        if let Some(activity) = &self.activity {
            activity.record(ActivityEvent::MissionReclaimed {
                mission: mission.short_id().to_string(),
                idle_secs: idle.as_secs(),
            });
        }
        Ok(())
    }
}

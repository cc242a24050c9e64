//! Title reconciler.
//!
//! Keeps each slot's window name in line with what the mission is about,
//! without fighting a user who renamed the window by hand.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::log::{ActivityEvent, ActivityLog};
use crate::periodic::Shutdown;
use crate::pool::SlotDisplay;
use crate::scanner::ScanEvent;
use crate::store::{Mission, MissionStore, Session, StoreError};

const ELLIPSIS: char = '…';

/// How often the reconciler thread checks for shutdown while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Display title for a mission, most specific source first: the session's
/// custom title, its auto summary, the repository name, the short id.
pub fn best_title(session: Option<&Session>, mission: &Mission) -> String {
    if let Some(session) = session {
        if !session.custom_title.trim().is_empty() {
            return session.custom_title.clone();
        }
        if !session.auto_summary.trim().is_empty() {
            return session.auto_summary.clone();
        }
    }
    match repo_short_name(&mission.git_repo) {
        Some(name) => name.to_string(),
        None => mission.short_id().to_string(),
    }
}

/// Last path segment of a repository reference, without a `.git` suffix.
fn repo_short_name(repo: &str) -> Option<&str> {
    let trimmed = repo.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    let name = trimmed.rsplit(['/', ':']).next().unwrap_or(trimmed);
    (!name.is_empty()).then_some(name)
}

/// Collapse runs of whitespace and cut to `max_width` characters, ending
/// with an ellipsis when something was cut.
pub fn fit_title(raw: &str, max_width: usize) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_width {
        return collapsed;
    }
    let keep = max_width.saturating_sub(1);
    let mut cut: String = collapsed.chars().take(keep).collect();
    cut.truncate(cut.trim_end().len());
    cut.push(ELLIPSIS);
    cut
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleOutcome {
    NoSlot,
    /// The window has more than one pane.
    SplitWindow,
    /// Someone renamed the window since we last set it.
    UserRenamed { current: String },
    Unchanged,
    Applied(String),
    /// tmux refused the rename; nothing was recorded.
    RenameFailed,
}

pub struct TitleReconciler {
    store: Arc<dyn MissionStore>,
    display: Arc<dyn SlotDisplay>,
    max_width: usize,
    activity: Option<Arc<ActivityLog>>,
}

impl TitleReconciler {
    pub fn new(store: Arc<dyn MissionStore>, display: Arc<dyn SlotDisplay>, max_width: usize) -> Self {
        Self {
            store,
            display,
            max_width,
            activity: None,
        }
    }

    pub fn with_activity_log(mut self, activity: Arc<ActivityLog>) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Converge one mission's window name. Safe to call from any trigger.
    pub fn apply(&self, mission_id: &str) -> Result<TitleOutcome> {
        let mission = self
            .store
            .get_mission(mission_id)?
            .ok_or_else(|| StoreError::NotFound(mission_id.to_string()))?;
        let session = self.store.get_active_session(mission_id)?;
        let desired = fit_title(&best_title(session.as_ref(), &mission), self.max_width);

        let Some(slot) = mission.slot_handle.as_deref() else {
            return Ok(TitleOutcome::NoSlot);
        };

        let panes = self
            .display
            .pane_count(slot)
            .with_context(|| format!("failed to count panes of {slot}"))?;
        if panes != 1 {
            debug!(mission = mission.short_id(), panes, "window is split; leaving title alone");
            return Ok(TitleOutcome::SplitWindow);
        }

        if !mission.applied_title.is_empty() {
            let current = self
                .display
                .window_name(slot)
                .with_context(|| format!("failed to read window name of {slot}"))?;
            if current != mission.applied_title {
                debug!(
                    mission = mission.short_id(),
                    current = %current,
                    applied = %mission.applied_title,
                    "window was renamed by hand; respecting it"
                );
                return Ok(TitleOutcome::UserRenamed { current });
            }
        }

        if desired == mission.applied_title {
            return Ok(TitleOutcome::Unchanged);
        }

        if let Err(e) = self.display.rename(slot, &desired) {
            warn!(mission = mission.short_id(), error = %e, "failed to rename window");
            return Ok(TitleOutcome::RenameFailed);
        }
        self.store.set_applied_title(&mission.id, &desired)?;

        info!(mission = mission.short_id(), title = %desired, "title applied");
        if let Some(activity) = &self.activity {
            activity.record(ActivityEvent::TitleApplied {
                mission: mission.short_id().to_string(),
                title: desired.clone(),
            });
        }
        Ok(TitleOutcome::Applied(desired))
    }

    /// Apply titles for every mission named by incoming [`ScanEvent`]s until
    /// `shutdown` fires or every sender is gone.
    pub fn spawn(self, events: Receiver<ScanEvent>, shutdown: Shutdown) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("titles".to_string())
            .spawn(move || {
                info!(task = "titles", "loop started");
                while !shutdown.is_triggered() {
                    let first = match events.recv_timeout(POLL_INTERVAL) {
                        Ok(event) => event,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    // A burst of scan results for one mission needs one apply.
                    let mut pending = BTreeSet::new();
                    for event in std::iter::once(first).chain(events.try_iter()) {
                        let ScanEvent::MetadataChanged { mission_id } = event;
                        pending.insert(mission_id);
                    }
                    for mission_id in pending {
                        if let Err(e) = self.apply(&mission_id) {
                            let message = format!("{e:#}");
                            warn!(task = "titles", item = %mission_id, error = %message, "title reconcile failed");
                        }
                    }
                }
                info!(task = "titles", "loop stopped");
            })
            .context("failed to spawn titles thread")
    }
}

//! Repository refresh worker.
//!
//! Requests go through a bounded queue to a single consumer thread, so git
//! never runs twice at once against the same (or any) mirror. A refresh
//! force-syncs the clone, garbage-collects when new commits arrived, and runs
//! the repository's post-update hook.

mod git;
mod hook;

pub use git::{GitCli, GitOps};
pub use hook::{HookLimits, HookOutcome, run_hook};

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::ConfigSource;
use crate::log::{ActivityEvent, ActivityLog};
use crate::periodic::{CycleReport, Shutdown};

/// How often a waiting worker re-checks for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoUpdateRequest {
    /// Repository name as configured in `[[repos]]`.
    pub repo: String,
    pub refresh_default_branch: bool,
    /// Run the post-update hook even when nothing new arrived.
    pub force_hook: bool,
}

impl RepoUpdateRequest {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            refresh_default_branch: false,
            force_hook: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("repo update queue is full ({capacity} pending)")]
    Full { capacity: usize },
    #[error("repo update queue is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Folded into a request for the same repository that was still waiting.
    Merged,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<RepoUpdateRequest>,
    closed: bool,
}

/// Bounded FIFO of pending refreshes. Producers never block.
#[derive(Debug)]
pub struct RepoUpdateQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
}

impl RepoUpdateQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_enqueue(&self, request: RepoUpdateRequest) -> Result<Enqueued, QueueError> {
        let mut state = self.state();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if let Some(waiting) = state.pending.iter_mut().find(|r| r.repo == request.repo) {
            waiting.refresh_default_branch |= request.refresh_default_branch;
            waiting.force_hook |= request.force_hook;
            return Ok(Enqueued::Merged);
        }
        if state.pending.len() >= self.capacity {
            return Err(QueueError::Full {
                capacity: self.capacity,
            });
        }
        state.pending.push_back(request);
        self.available.notify_one();
        Ok(Enqueued::Queued)
    }

    /// Block until a request is available. `None` once the queue is closed
    /// and drained, or when `shutdown` fires.
    pub fn pop(&self, shutdown: &Shutdown) -> Option<RepoUpdateRequest> {
        let mut state = self.state();
        loop {
            if shutdown.is_triggered() {
                return None;
            }
            if let Some(request) = state.pending.pop_front() {
                return Some(request);
            }
            if state.closed {
                return None;
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, POLL_INTERVAL)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    /// Refuse new requests and wake the consumer.
    pub fn close(&self) {
        self.state().closed = true;
        self.available.notify_all();
    }
}

/// What one refresh did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub before: String,
    pub after: String,
    pub changed: bool,
    pub hook: Option<HookOutcome>,
}

/// Processes refresh requests one at a time.
pub struct RepoUpdater {
    git: Arc<dyn GitOps>,
    config: Arc<dyn ConfigSource>,
    activity: Option<Arc<ActivityLog>>,
    shutdown: Shutdown,
}

impl RepoUpdater {
    pub fn new(git: Arc<dyn GitOps>, config: Arc<dyn ConfigSource>, shutdown: Shutdown) -> Self {
        Self {
            git,
            config,
            activity: None,
            shutdown,
        }
    }

    pub fn with_activity_log(mut self, activity: Arc<ActivityLog>) -> Self {
        self.activity = Some(activity);
        self
    }

    /// Refresh one repository. Configuration is read fresh for every request.
    ///
    /// Git failures are returned; hook failures are logged and reported in
    /// the outcome, never as an error.
    pub fn process(&self, request: &RepoUpdateRequest) -> Result<UpdateOutcome> {
        let config = self.config.load().context("failed to load config")?;
        let repo = config
            .repo(&request.repo)
            .ok_or_else(|| anyhow!("repository '{}' is not configured", request.repo))?;
        let path = repo.path.as_path();

        if request.refresh_default_branch {
            if let Err(e) = self.git.refresh_default_branch(path) {
                warn!(repo = %repo.name, error = %e, "failed to refresh default branch");
            }
        }

        let before = self.git.head(path)?;
        self.git.sync(path)?;
        let after = self.git.head(path)?;
        let changed = before != after && !after.is_empty();

        if changed {
            info!(repo = %repo.name, before = %before, after = %after, "repository updated");
            // fetch + reset never triggers git's automatic gc.
            if let Err(e) = self.git.gc(path) {
                warn!(repo = %repo.name, error = %e, "git gc failed");
            }
        } else {
            debug!(repo = %repo.name, head = %after, "repository unchanged");
        }
        self.record(ActivityEvent::RepoUpdated {
            repo: repo.name.clone(),
            before: before.clone(),
            after: after.clone(),
            changed,
        });

        let mut hook = None;
        if changed || request.force_hook {
            if let Some(command) = repo.post_update_hook.as_deref() {
                let limits = HookLimits {
                    soft: config.repo_update.hook_soft_timeout(),
                    hard: config.repo_update.hook_timeout(),
                };
                let outcome = run_hook(&repo.name, command, path, limits, &self.shutdown)
                    .unwrap_or_else(|e| HookOutcome::Failed {
                        exit_code: None,
                        stderr: format!("{e:#}"),
                        elapsed: Duration::ZERO,
                        soft_warnings: 0,
                    });
                self.report_hook(&repo.name, limits, &outcome);
                hook = Some(outcome);
            }
        }

        Ok(UpdateOutcome {
            before,
            after,
            changed,
            hook,
        })
    }

    fn report_hook(&self, repo: &str, limits: HookLimits, outcome: &HookOutcome) {
        match outcome {
            HookOutcome::Succeeded {
                elapsed,
                soft_warnings,
            } => {
                info!(
                    repo,
                    elapsed_secs = elapsed.as_secs(),
                    soft_warnings,
                    "post-update hook finished"
                );
                self.record(ActivityEvent::HookCompleted {
                    repo: repo.to_string(),
                    elapsed_secs: elapsed.as_secs(),
                });
            }
            HookOutcome::Failed {
                exit_code, stderr, ..
            } => {
                warn!(repo, exit_code = ?exit_code, stderr = %stderr, "post-update hook failed");
                self.record(ActivityEvent::HookFailed {
                    repo: repo.to_string(),
                    exit_code: *exit_code,
                    stderr: stderr.clone(),
                });
            }
            HookOutcome::TimedOut { stderr, .. } => {
                warn!(
                    repo,
                    timeout_secs = limits.hard.as_secs(),
                    stderr = %stderr,
                    "post-update hook timed out and was killed"
                );
                self.record(ActivityEvent::HookTimedOut {
                    repo: repo.to_string(),
                    timeout_secs: limits.hard.as_secs(),
                });
            }
            HookOutcome::Cancelled => {
                warn!(repo, "post-update hook interrupted by shutdown");
            }
        }
    }

    fn record(&self, event: ActivityEvent) {
        if let Some(activity) = &self.activity {
            activity.record(event);
        }
    }

    /// Consume `queue` on a dedicated thread until it closes or shutdown fires.
    pub fn spawn_worker(self, queue: Arc<RepoUpdateQueue>) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("repo-update".to_string())
            .spawn(move || {
                info!(task = "repo-update", "worker started");
                while let Some(request) = queue.pop(&self.shutdown) {
                    match catch_unwind(AssertUnwindSafe(|| self.process(&request))) {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            let message = format!("{e:#}");
                            warn!(task = "repo-update", item = %request.repo, error = %message, "repo update failed");
                        }
                        Err(_) => error!(task = "repo-update", item = %request.repo, "repo update panicked"),
                    }
                }
                info!(task = "repo-update", "worker stopped");
            })
            .context("failed to spawn repo-update worker")
    }
}

/// Periodic producer: one request per configured repository each cycle.
pub struct UpdateTrigger {
    queue: Arc<RepoUpdateQueue>,
    config: Arc<dyn ConfigSource>,
    cycle: u64,
}

impl UpdateTrigger {
    pub fn new(queue: Arc<RepoUpdateQueue>, config: Arc<dyn ConfigSource>) -> Self {
        Self {
            queue,
            config,
            cycle: 0,
        }
    }

    pub fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        self.cycle += 1;

        let config = match self.config.load() {
            Ok(config) => config,
            Err(e) => {
                report.fail("config", e);
                return report;
            }
        };
        let every = config.repo_update.default_branch_every;
        let refresh = every > 0 && self.cycle % every == 0;

        for repo in &config.repos {
            let request = RepoUpdateRequest {
                repo: repo.name.clone(),
                refresh_default_branch: refresh,
                force_hook: false,
            };
            match self.queue.try_enqueue(request) {
                Ok(Enqueued::Queued) => report.acted += 1,
                Ok(Enqueued::Merged) => report.skipped += 1,
                Err(e) => report.fail(repo.name.clone(), e.into()),
            }
        }
        report
    }
}

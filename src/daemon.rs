//! Daemon wiring: starts every background loop and stops them together.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info};

use crate::config::{ConfigSource, DaemonConfig};
use crate::log::ActivityLog;
use crate::periodic::{self, Shutdown};
use crate::pool::{Pool, SlotDisplay};
use crate::reaper::Reaper;
use crate::repo_update::{GitOps, RepoUpdateQueue, RepoUpdater, UpdateTrigger};
use crate::runner::MissionRunner;
use crate::scanner::Scanner;
use crate::store::MissionStore;
use crate::titles::TitleReconciler;

/// Everything the loops share.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn MissionStore>,
    pub pool: Arc<dyn Pool>,
    pub display: Arc<dyn SlotDisplay>,
    pub runner: Arc<dyn MissionRunner>,
    pub git: Arc<dyn GitOps>,
    pub config_source: Arc<dyn ConfigSource>,
    pub activity: Arc<ActivityLog>,
}

/// A running daemon. Dropping it without [`shutdown`](Self::shutdown) leaves
/// the loops running.
pub struct Daemon {
    shutdown: Shutdown,
    queue: Arc<RepoUpdateQueue>,
    threads: Vec<(&'static str, JoinHandle<()>)>,
}

impl Daemon {
    /// Start the scanner, title reconciler, idle reaper, repo-update worker
    /// and its periodic trigger.
    pub fn start(services: Services, config: &DaemonConfig, missions_root: &std::path::Path) -> Result<Self> {
        let shutdown = Shutdown::new();
        let queue = Arc::new(RepoUpdateQueue::new(config.repo_update.queue_capacity));
        let mut daemon = Self {
            shutdown: shutdown.clone(),
            queue: queue.clone(),
            threads: Vec::new(),
        };

        // If anything below fails, stop what already started.
        if let Err(e) = daemon.spawn_all(services, config, missions_root) {
            daemon.shutdown();
            return Err(e);
        }
        info!(threads = daemon.threads.len(), "daemon started");
        Ok(daemon)
    }

    fn spawn_all(&mut self, services: Services, config: &DaemonConfig, missions_root: &std::path::Path) -> Result<()> {
        services
            .pool
            .ensure_pool()
            .context("failed to create pool session")?;

        let (events_tx, events_rx) = mpsc::channel();

        let titles = TitleReconciler::new(
            services.store.clone(),
            services.display.clone(),
            config.titles.max_width,
        )
        .with_activity_log(services.activity.clone());
        self.threads
            .push(("titles", titles.spawn(events_rx, self.shutdown.clone())?));

        let scanner = Scanner::new(
            services.store.clone(),
            missions_root,
            config.scanner.max_line_bytes,
        )
        .with_events(events_tx);
        self.threads.push((
            "scanner",
            periodic::spawn(
                "scanner",
                config.scanner.interval(),
                self.shutdown.clone(),
                move || scanner.scan_cycle(),
            )?,
        ));

        let reaper = Reaper::new(
            services.store.clone(),
            services.pool.clone(),
            services.runner.clone(),
            config.reaper.idle_threshold(),
        )
        .with_activity_log(services.activity.clone());
        self.threads.push((
            "reaper",
            periodic::spawn(
                "reaper",
                config.reaper.interval(),
                self.shutdown.clone(),
                move || reaper.run_cycle(Utc::now()),
            )?,
        ));

        let updater = RepoUpdater::new(
            services.git.clone(),
            services.config_source.clone(),
            self.shutdown.clone(),
        )
        .with_activity_log(services.activity.clone());
        self.threads
            .push(("repo-update", updater.spawn_worker(self.queue.clone())?));

        let mut trigger = UpdateTrigger::new(self.queue.clone(), services.config_source.clone());
        self.threads.push((
            "repo-trigger",
            periodic::spawn(
                "repo-trigger",
                config.repo_update.interval(),
                self.shutdown.clone(),
                move || trigger.run_cycle(),
            )?,
        ));
        Ok(())
    }

    /// Producer side of the repo-update queue, for push events.
    pub fn repo_queue(&self) -> Arc<RepoUpdateQueue> {
        self.queue.clone()
    }

    pub fn shutdown_token(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Fire the shutdown token and wait for every loop to exit.
    pub fn shutdown(&mut self) {
        self.shutdown.trigger();
        self.queue.close();
        for (name, handle) in self.threads.drain(..) {
            if handle.join().is_err() {
                error!(task = name, "thread panicked during shutdown");
            }
        }
        info!("daemon stopped");
    }

    /// Block until the shutdown token fires (e.g. from a signal handler),
    /// then stop every loop.
    pub fn wait(mut self) {
        while !self.shutdown.wait_timeout(std::time::Duration::from_secs(3600)) {}
        self.shutdown();
    }
}

mod cli;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use tracing::info;

use cli::{Cli, Command};
use fleetd::config::{DaemonConfig, FileConfigSource};
use fleetd::daemon::{Daemon, Services};
use fleetd::log::ActivityLog;
use fleetd::missions::Missions;
use fleetd::paths::Layout;
use fleetd::periodic::Shutdown;
use fleetd::pool::TmuxPool;
use fleetd::repo_update::{GitCli, HookOutcome, RepoUpdateRequest, RepoUpdater};
use fleetd::runner::PidRunner;
use fleetd::store::{MissionFilter, MissionStore, NewMission, SqliteStore};
use fleetd::titles::{TitleOutcome, TitleReconciler};
use fleetd::tmux::Tmux;

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<24} {value}\n"));
}

fn render_config_human(config: &DaemonConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Pool\n");
    push_kv(&mut output, "session", &config.pool.session);
    push_kv(
        &mut output,
        "socket",
        config.pool.socket.as_deref().unwrap_or("(default server)"),
    );
    push_kv(&mut output, "agent_command", &config.pool.agent_command);
    push_kv(
        &mut output,
        "default_view",
        config.pool.default_view.as_deref().unwrap_or("(none)"),
    );
    output.push('\n');

    output.push_str("Reaper\n");
    push_kv(&mut output, "interval", format!("{}s", config.reaper.interval_secs));
    push_kv(
        &mut output,
        "idle_threshold",
        format!("{}s", config.reaper.idle_threshold_secs),
    );
    output.push('\n');

    output.push_str("Scanner\n");
    push_kv(&mut output, "interval", format!("{}s", config.scanner.interval_secs));
    push_kv(&mut output, "max_line_bytes", config.scanner.max_line_bytes);
    output.push('\n');

    output.push_str("Titles\n");
    push_kv(&mut output, "max_width", config.titles.max_width);
    output.push('\n');

    output.push_str("Repo Update\n");
    push_kv(&mut output, "queue_capacity", config.repo_update.queue_capacity);
    push_kv(
        &mut output,
        "interval",
        format!("{}s", config.repo_update.interval_secs),
    );
    push_kv(
        &mut output,
        "default_branch_every",
        config.repo_update.default_branch_every,
    );
    push_kv(
        &mut output,
        "hook_timeout",
        format!("{}s", config.repo_update.hook_timeout_secs),
    );
    push_kv(
        &mut output,
        "hook_soft_timeout",
        format!("{}s", config.repo_update.hook_soft_timeout_secs),
    );
    output.push('\n');

    output.push_str("Repositories\n");
    if config.repos.is_empty() {
        push_kv(&mut output, "entries", "(none)");
    } else {
        for repo in &config.repos {
            output.push_str(&format!("  - {} => {}\n", repo.name, repo.path.display()));
            if let Some(hook) = &repo.post_update_hook {
                output.push_str(&format!("      hook: {hook}\n"));
            }
        }
    }
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(config: &DaemonConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload = serde_json::to_value(config).context("failed to serialize config")?;
    if let Some(map) = payload.as_object_mut() {
        map.insert(
            "source_path".to_string(),
            serde_json::Value::String(config_source_label(config_path)),
        );
    }
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

fn describe_hook(outcome: &HookOutcome) -> String {
    match outcome {
        HookOutcome::Succeeded { elapsed, .. } => format!("hook succeeded in {}s", elapsed.as_secs()),
        HookOutcome::Failed {
            exit_code, stderr, ..
        } => {
            let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
            let tail = stderr.trim();
            if tail.is_empty() {
                format!("hook failed (exit {code})")
            } else {
                format!("hook failed (exit {code}): {tail}")
            }
        }
        HookOutcome::TimedOut { elapsed, .. } => {
            format!("hook killed after {}s", elapsed.as_secs())
        }
        HookOutcome::Cancelled => "hook cancelled".to_string(),
    }
}

fn pick_view(view: Option<String>, config: &DaemonConfig) -> Result<String> {
    match view.or_else(|| config.pool.default_view.clone()) {
        Some(view) => Ok(view),
        None => bail!("no view given: pass --view or set pool.default_view"),
    }
}

fn open_store(layout: &Layout) -> Result<Arc<SqliteStore>> {
    std::fs::create_dir_all(layout.root())
        .with_context(|| format!("failed to create {}", layout.root().display()))?;
    let path = layout.database();
    let store = SqliteStore::open(&path)
        .with_context(|| format!("failed to open mission store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_config_command = matches!(&cli.command, Command::Config { .. });

    let filter = match cli.verbose {
        0 if is_config_command => "fleetd=warn",
        0 => "fleetd=info",
        1 => "fleetd=debug",
        _ => "fleetd=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let layout = Layout::resolve()?;
    let (config, config_path) = DaemonConfig::load(&layout.config_file())?;

    if !is_config_command || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no config.toml found, using defaults"),
        }
    }

    let command = match cli.command {
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
            return Ok(());
        }
        command => command,
    };

    let store = open_store(&layout)?;
    let activity = Arc::new(ActivityLog::new(&layout.activity_log())?);
    let tmux = Tmux::new(config.pool.socket.clone());
    let pool = Arc::new(TmuxPool::new(tmux.clone(), config.pool.session.clone()));
    let missions = Missions::new(
        store.clone(),
        pool.clone(),
        Arc::new(PidRunner),
        config.pool.agent_command.clone(),
    )
    .with_activity_log(activity.clone());

    match command {
        Command::Config { .. } => {}
        Command::Run => {
            tmux.check()?;
            let services = Services {
                store,
                pool: pool.clone(),
                display: pool,
                runner: Arc::new(PidRunner),
                git: Arc::new(GitCli),
                config_source: Arc::new(FileConfigSource::new(layout.config_file())),
                activity,
            };
            let daemon = Daemon::start(services, &config, &layout.missions_dir())?;

            let shutdown = daemon.shutdown_token();
            ctrlc::set_handler(move || shutdown.trigger())
                .context("failed to install Ctrl-C handler")?;
            info!(home = %layout.root().display(), "fleetd running; press Ctrl-C to stop");
            daemon.wait();
        }
        Command::New {
            repo,
            cron_id,
            cron_name,
        } => {
            let mission = store.create_mission(&NewMission {
                git_repo: repo,
                cron_id,
                cron_name,
            })?;
            println!("{}", mission.id);
        }
        Command::List { all } => {
            let filter = MissionFilter {
                include_archived: all,
                ..MissionFilter::default()
            };
            for mission in store.list_missions(&filter)? {
                let title = if mission.applied_title.is_empty() {
                    "-"
                } else {
                    mission.applied_title.as_str()
                };
                println!(
                    "{:<8}  {:<8}  {:<6}  {:<30}  {}",
                    mission.short_id(),
                    mission.status.as_str(),
                    mission.slot_handle.as_deref().unwrap_or("-"),
                    title,
                    mission.git_repo,
                );
            }
        }
        Command::Resolve { prefix } => {
            println!("{}", store.resolve_short_id(&prefix)?);
        }
        Command::Attach { id, view } => {
            let view = pick_view(view, &config)?;
            tmux.check()?;
            let outcome = missions.attach(&id, &view)?;
            println!(
                "{} {} in {view} ({})",
                outcome.mission_id,
                if outcome.linked { "shown" } else { "already shown" },
                if outcome.created {
                    "started"
                } else {
                    "running"
                },
            );
        }
        Command::Detach { id, view } => {
            let view = pick_view(view, &config)?;
            tmux.check()?;
            missions.detach(&id, &view)?;
        }
        Command::Stop { id } => {
            tmux.check()?;
            let mission = missions.stop(&id)?;
            println!("stopped {}", mission.short_id());
        }
        Command::Archive { id } => {
            tmux.check()?;
            let mission = missions.archive(&id)?;
            println!("archived {}", mission.short_id());
        }
        Command::Heartbeat { id, active, pid } => {
            let mission = missions.resolve(&id)?;
            let now = Utc::now();
            store.set_heartbeat(&mission.id, now)?;
            if let Some(pid) = pid {
                store.set_process_id(&mission.id, Some(pid))?;
            }
            if active {
                store.set_last_active(&mission.id, now)?;
                store.increment_prompt_count(&mission.id)?;
            }
        }
        Command::Retitle { id } => {
            tmux.check()?;
            let mission = missions.resolve(&id)?;
            let reconciler = TitleReconciler::new(store, pool, config.titles.max_width)
                .with_activity_log(activity);
            match reconciler.apply(&mission.id)? {
                TitleOutcome::Applied(title) => println!("{title}"),
                TitleOutcome::NoSlot => println!("{} has no slot", mission.short_id()),
                TitleOutcome::SplitWindow => println!("window is split; title left alone"),
                TitleOutcome::UserRenamed { current } => {
                    println!("window was renamed to '{current}'; title left alone")
                }
                TitleOutcome::Unchanged => println!("title unchanged"),
                TitleOutcome::RenameFailed => bail!("tmux refused the rename"),
            }
        }
        Command::UpdateRepo {
            name,
            default_branch,
            force,
        } => {
            let shutdown = Shutdown::new();
            let cancel = shutdown.clone();
            ctrlc::set_handler(move || cancel.trigger())
                .context("failed to install Ctrl-C handler")?;
            let updater = RepoUpdater::new(
                Arc::new(GitCli),
                Arc::new(FileConfigSource::new(layout.config_file())),
                shutdown,
            )
            .with_activity_log(activity);
            let request = RepoUpdateRequest {
                refresh_default_branch: default_branch,
                force_hook: force,
                ..RepoUpdateRequest::new(name)
            };
            let outcome = updater.process(&request)?;
            if outcome.changed {
                println!("{}: {} -> {}", request.repo, outcome.before, outcome.after);
            } else {
                println!("{}: up to date at {}", request.repo, outcome.after);
            }
            if let Some(hook) = &outcome.hook {
                println!("{}", describe_hook(hook));
            }
        }
    }

    Ok(())
}

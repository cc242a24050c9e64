//! Post-update hooks: user shell commands run inside a freshly synced repo.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::periodic::Shutdown;

/// How often a running hook is checked for exit, timeout and shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Only the tail of a hook's stderr is kept for reporting.
const STDERR_TAIL_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookLimits {
    /// After this long, warn, and keep warning every `soft` interval.
    pub soft: Duration,
    /// Kill the hook at this point.
    pub hard: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// `soft_warnings` counts the "still running" warnings logged on the way.
    Succeeded {
        elapsed: Duration,
        soft_warnings: u32,
    },
    Failed {
        exit_code: Option<i32>,
        stderr: String,
        elapsed: Duration,
        soft_warnings: u32,
    },
    TimedOut {
        elapsed: Duration,
        stderr: String,
        soft_warnings: u32,
    },
    /// The daemon shut down while the hook was running.
    Cancelled,
}

/// Run `command` through `sh -c` with `cwd` as working directory.
///
/// Returns an error only when the hook could not be started at all; every
/// way a started hook can end is a [`HookOutcome`].
pub fn run_hook(
    repo: &str,
    command: &str,
    cwd: &Path,
    limits: HookLimits,
    shutdown: &Shutdown,
) -> Result<HookOutcome> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group so a timeout kills everything the hook started.
        cmd.process_group(0);
    }
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to start hook for {repo} in {}", cwd.display()))?;
    debug!(repo, pid = child.id(), command, "hook started");

    let stderr = collect_stderr(&mut child);
    let started = Instant::now();
    let mut next_warning = limits.soft;
    let mut soft_warnings = 0u32;

    loop {
        if let Some(status) = child.try_wait().context("failed to poll hook")? {
            let elapsed = started.elapsed();
            let stderr = stderr_text(&stderr);
            return Ok(if status.success() {
                HookOutcome::Succeeded {
                    elapsed,
                    soft_warnings,
                }
            } else {
                HookOutcome::Failed {
                    exit_code: status.code(),
                    stderr,
                    elapsed,
                    soft_warnings,
                }
            });
        }

        let elapsed = started.elapsed();
        if elapsed >= limits.hard {
            kill(&mut child);
            return Ok(HookOutcome::TimedOut {
                elapsed,
                stderr: stderr_text(&stderr),
                soft_warnings,
            });
        }
        if elapsed >= next_warning {
            warn!(
                repo,
                elapsed_secs = elapsed.as_secs(),
                timeout_secs = limits.hard.as_secs(),
                "post-update hook still running"
            );
            soft_warnings += 1;
            next_warning += limits.soft.max(POLL_INTERVAL);
        }

        let step = POLL_INTERVAL.min(limits.hard - elapsed);
        if shutdown.wait_timeout(step) {
            kill(&mut child);
            return Ok(HookOutcome::Cancelled);
        }
    }
}

/// Drain the child's stderr on a separate thread so a chatty hook never
/// blocks on a full pipe.
fn collect_stderr(child: &mut Child) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    let Some(mut pipe) = child.stderr.take() else {
        let _ = tx.send(Vec::new());
        return rx;
    };
    let spawned = thread::Builder::new()
        .name("hook-stderr".to_string())
        .spawn(move || {
            let mut tail = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                match pipe.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        tail.extend_from_slice(&chunk[..n]);
                        if tail.len() > STDERR_TAIL_BYTES {
                            let excess = tail.len() - STDERR_TAIL_BYTES;
                            tail.drain(..excess);
                        }
                    }
                }
            }
            let _ = tx.send(tail);
        });
    if let Err(e) = spawned {
        warn!(error = %e, "failed to spawn hook stderr reader");
    }
    rx
}

/// Whatever stderr the reader collected. A grandchild still holding the pipe
/// open must not hang the worker, so this waits only briefly.
fn stderr_text(rx: &mpsc::Receiver<Vec<u8>>) -> String {
    match rx.recv_timeout(Duration::from_secs(2)) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
        Err(_) => String::new(),
    }
}

fn kill(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: signalling our own child's process group.
            unsafe {
                libc::kill(-pgid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

//! tmux command plumbing.
//!
//! Thin wrapper over the tmux CLI. Every command can be pointed at a dedicated
//! server socket (`tmux -L <name>`) so the pool can live on its own server and
//! tests never touch the user's sessions.

use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// Handle to one tmux server.
#[derive(Debug, Clone, Default)]
pub struct Tmux {
    socket: Option<String>,
}

/// One row of `list-windows -a`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRow {
    pub session: String,
    pub window_id: String,
    pub name: String,
    /// Value of the window's mission tag option, empty when untagged.
    pub tag: String,
}

impl Tmux {
    pub fn new(socket: Option<String>) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> Option<&str> {
        self.socket.as_deref()
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("tmux");
        if let Some(socket) = &self.socket {
            cmd.args(["-L", socket]);
        }
        cmd
    }

    fn output(&self, args: &[&str]) -> Result<Output> {
        self.command()
            .args(args)
            .output()
            .with_context(|| format!("failed to run tmux {}", args.first().unwrap_or(&"")))
    }

    /// Check that tmux is installed and reachable; returns the version line.
    pub fn check(&self) -> Result<String> {
        let output = Command::new("tmux").arg("-V").output().context(
            "tmux not found; install tmux (e.g., `apt install tmux` or `brew install tmux`)",
        )?;

        if !output.status.success() {
            bail!(
                "tmux -V failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(version = %version, "tmux found");
        Ok(version)
    }

    /// Run a tmux command and return its trimmed stdout; non-zero exit is an error
    /// carrying tmux's stderr.
    pub fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "tmux {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    /// Run a command, reporting only whether it succeeded.
    pub fn succeeds(&self, args: &[&str]) -> bool {
        self.output(args)
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Check if a session exists (exact name match).
    pub fn has_session(&self, session: &str) -> bool {
        let target = format!("={session}");
        self.succeeds(&["has-session", "-t", &target])
    }

    /// Create a detached session whose first window is named `window`.
    pub fn new_session(&self, session: &str, window: &str) -> Result<()> {
        self.run(&["new-session", "-d", "-s", session, "-n", window])
            .with_context(|| format!("failed to create tmux session '{session}'"))?;
        Ok(())
    }

    /// Create a detached window in `session` running `command`; returns its pane id.
    pub fn new_window(&self, session: &str, name: &str, command: &str) -> Result<String> {
        let target = format!("={session}:");
        let pane = self
            .run(&[
                "new-window",
                "-d",
                "-t",
                &target,
                "-n",
                name,
                "-P",
                "-F",
                "#{pane_id}",
                command,
            ])
            .with_context(|| format!("failed to create window '{name}' in '{session}'"))?;
        let pane = pane.trim().to_string();
        if pane.is_empty() {
            bail!("tmux returned empty pane id for new window '{name}'");
        }
        Ok(pane)
    }

    /// Set a window-scoped option on the window containing `target`.
    pub fn set_window_option(&self, target: &str, option: &str, value: &str) -> Result<()> {
        self.run(&["set-option", "-w", "-t", target, option, value])
            .with_context(|| format!("failed to set window option '{option}' on '{target}'"))?;
        Ok(())
    }

    /// List every window on the server, across all sessions.
    ///
    /// A server that is not running has no windows; that is not an error.
    pub fn list_windows_all(&self, tag_option: &str) -> Result<Vec<WindowRow>> {
        let format = format!("#{{session_name}}\t#{{window_id}}\t#{{window_name}}\t#{{{tag_option}}}");
        let output = self.output(&["list-windows", "-a", "-F", &format])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if server_not_running(&stderr) {
                return Ok(Vec::new());
            }
            bail!("tmux list-windows failed: {}", stderr.trim());
        }
        Ok(parse_window_rows(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Query a format string against a target (`display-message -p`).
    pub fn display(&self, target: &str, format: &str) -> Result<String> {
        self.run(&["display-message", "-p", "-t", target, format])
            .with_context(|| format!("failed to query '{format}' for target '{target}'"))
    }

    pub fn link_window(&self, source: &str, target: &str) -> Result<()> {
        self.run(&["link-window", "-d", "-a", "-s", source, "-t", target])
            .with_context(|| format!("failed to link '{source}' into '{target}'"))?;
        Ok(())
    }

    pub fn unlink_window(&self, target: &str) -> Result<()> {
        self.run(&["unlink-window", "-t", target])
            .with_context(|| format!("failed to unlink '{target}'"))?;
        Ok(())
    }

    pub fn kill_window(&self, target: &str) -> Result<()> {
        self.run(&["kill-window", "-t", target])
            .with_context(|| format!("failed to kill window '{target}'"))?;
        Ok(())
    }

    pub fn rename_window(&self, target: &str, name: &str) -> Result<()> {
        self.run(&["rename-window", "-t", target, name])
            .with_context(|| format!("failed to rename window '{target}'"))?;
        Ok(())
    }

    /// Kill the whole server. Only meaningful for dedicated sockets.
    pub fn kill_server(&self) -> Result<()> {
        let output = self.output(&["kill-server"])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !server_not_running(&stderr) {
                bail!("tmux kill-server failed: {}", stderr.trim());
            }
        }
        Ok(())
    }
}

fn server_not_running(stderr: &str) -> bool {
    stderr.contains("no server running")
        || stderr.contains("error connecting")
        || stderr.contains("No such file or directory")
}

fn parse_window_rows(stdout: &str) -> Vec<WindowRow> {
    let mut rows = Vec::new();
    for line in stdout.lines() {
        let mut parts = line.splitn(4, '\t');
        let Some(session) = parts.next() else { continue };
        let Some(window_id) = parts.next() else {
            continue;
        };
        let Some(name) = parts.next() else { continue };
        let tag = parts.next().unwrap_or("");
        rows.push(WindowRow {
            session: session.to_string(),
            window_id: window_id.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        });
    }
    rows
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::Tmux;

    static SOCKET_COUNTER: AtomicU64 = AtomicU64::new(1);

    /// An isolated tmux server, killed on drop. `None` when tmux is unavailable.
    pub struct TestServer {
        pub tmux: Tmux,
    }

    impl TestServer {
        pub fn start() -> Option<Self> {
            let probe = Tmux::default();
            probe.check().ok()?;
            let n = SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed);
            let socket = format!("fleetd-test-{}-{n}", std::process::id());
            Some(Self {
                tmux: Tmux::new(Some(socket)),
            })
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            let _ = self.tmux.kill_server();
        }
    }
}

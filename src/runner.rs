//! Liveness probe and stop control for mission processes.
//!
//! The wrapper that actually runs the agent CLI lives outside this crate; it
//! records its process id on the mission. This module only probes and signals
//! that pid.

use anyhow::{Result, bail};
use tracing::{debug, info};

use crate::store::Mission;

pub trait MissionRunner: Send + Sync {
    /// Whether the mission's recorded process is still alive.
    fn is_running(&self, mission: &Mission) -> bool;
    /// Ask the mission's process to exit.
    fn stop(&self, mission: &Mission) -> Result<()>;
}

/// [`MissionRunner`] that signals the recorded process id directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct PidRunner;

impl MissionRunner for PidRunner {
    fn is_running(&self, mission: &Mission) -> bool {
        mission.process_id.is_some_and(pid_alive)
    }

    fn stop(&self, mission: &Mission) -> Result<()> {
        let Some(pid) = mission.process_id else {
            debug!(mission = mission.short_id(), "no recorded process to stop");
            return Ok(());
        };
        if !pid_alive(pid) {
            debug!(mission = mission.short_id(), pid, "process already exited");
            return Ok(());
        }
        terminate(pid)?;
        info!(mission = mission.short_id(), pid, "sent SIGTERM to mission process");
        Ok(())
    }
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 performs the permission/existence check without delivering.
    // SAFETY: kill(2) takes plain integers; pid is positive, so no group or
    // broadcast target is addressed.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<()> {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        bail!("process id {pid} out of range");
    };
    if raw <= 0 {
        bail!("refusing to signal process id {pid}");
    }
    // SAFETY: kill(2) takes plain integers; raw is positive, so only that
    // single process is signalled.
    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        bail!("failed to send SIGTERM to {pid}: {err}");
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<()> {
    bail!("stopping process {pid} is only supported on unix")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mission_with;

    #[test]
    fn missing_pid_is_not_running() {
        let mission = mission_with(|_| {});
        assert!(!PidRunner.is_running(&mission));
        PidRunner.stop(&mission).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_running() {
        let mission = mission_with(|m| m.process_id = Some(std::process::id()));
        assert!(PidRunner.is_running(&mission));
    }

    #[cfg(unix)]
    #[test]
    fn stop_terminates_child_process() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let mission = mission_with(|m| m.process_id = Some(child.id()));
        assert!(PidRunner.is_running(&mission));

        PidRunner.stop(&mission).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(!PidRunner.is_running(&mission));
    }
}

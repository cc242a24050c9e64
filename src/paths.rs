use std::path::{Path, PathBuf};

use anyhow::{Result, bail};

const HOME_ENV: &str = "FLEETD_HOME";
const HOME_DIR: &str = ".fleetd";

/// On-disk layout of the daemon's state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the state directory: `$FLEETD_HOME` if set and non-empty,
    /// otherwise `~/.fleetd`.
    pub fn resolve() -> Result<Self> {
        if let Some(dir) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(dir));
        }
        let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) else {
            bail!("cannot locate state directory: neither {HOME_ENV} nor HOME is set");
        };
        Ok(Self::new(Path::new(&home).join(HOME_DIR)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Root of the per-mission conversation log trees.
    pub fn missions_dir(&self) -> PathBuf {
        self.root.join("missions")
    }

    pub fn database(&self) -> PathBuf {
        self.root.join("fleetd.db")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn activity_log(&self) -> PathBuf {
        self.root.join("logs").join("activity.jsonl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        previous: Option<std::ffi::OsString>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = std::env::var_os(key);
            unsafe { std::env::set_var(key, value) };
            Self { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.previous {
                Some(value) => unsafe { std::env::set_var(self.key, value) },
                None => unsafe { std::env::remove_var(self.key) },
            }
        }
    }

    #[test]
    fn layout_paths_hang_off_root() {
        let layout = Layout::new("/state");
        assert_eq!(layout.missions_dir(), Path::new("/state/missions"));
        assert_eq!(layout.database(), Path::new("/state/fleetd.db"));
        assert_eq!(layout.config_file(), Path::new("/state/config.toml"));
        assert_eq!(layout.activity_log(), Path::new("/state/logs/activity.jsonl"));
    }

    #[test]
    #[serial]
    fn env_override_wins() {
        let _guard = EnvGuard::set(HOME_ENV, "/tmp/fleetd-override");
        let layout = Layout::resolve().unwrap();
        assert_eq!(layout.root(), Path::new("/tmp/fleetd-override"));
    }

    #[test]
    #[serial]
    fn falls_back_to_home_directory() {
        let _home = EnvGuard::set("HOME", "/home/someone");
        let _override = EnvGuard::set(HOME_ENV, "");
        let layout = Layout::resolve().unwrap();
        assert_eq!(layout.root(), Path::new("/home/someone/.fleetd"));
    }
}

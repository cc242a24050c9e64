use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PoolConfig {
    /// tmux session holding every pooled slot.
    #[serde(default = "default_pool_session")]
    pub session: String,
    /// Dedicated tmux server socket (`tmux -L`). `None` uses the default server.
    #[serde(default)]
    pub socket: Option<String>,
    /// Command started in a fresh slot, with `FLEETD_MISSION_ID` set in its
    /// environment.
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    /// View slots are linked into when `attach` is given no `--view`.
    #[serde(default)]
    pub default_view: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ScannerConfig {
    #[serde(default = "default_scanner_interval_secs")]
    pub interval_secs: u64,
    /// Lines longer than this are skipped without parsing.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TitlesConfig {
    #[serde(default = "default_title_max_width")]
    pub max_width: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RepoUpdateConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_repo_interval_secs")]
    pub interval_secs: u64,
    /// Refresh `origin/HEAD` every Nth periodic cycle.
    #[serde(default = "default_branch_every")]
    pub default_branch_every: u64,
    #[serde(default = "default_hook_timeout_secs")]
    pub hook_timeout_secs: u64,
    #[serde(default = "default_hook_soft_timeout_secs")]
    pub hook_soft_timeout_secs: u64,
}

/// One repository kept in sync by the repo-update worker.
///
/// ```toml
/// [[repos]]
/// name = "api"
/// path = "/srv/mirrors/api"
/// post_update_hook = "make index"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RepoConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub post_update_hook: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct DaemonConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub titles: TitlesConfig,
    #[serde(default)]
    pub repo_update: RepoUpdateConfig,
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
}

fn default_pool_session() -> String {
    "fleet-pool".to_string()
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_reaper_interval_secs() -> u64 {
    120
}

fn default_idle_threshold_secs() -> u64 {
    30 * 60
}

fn default_scanner_interval_secs() -> u64 {
    3
}

fn default_max_line_bytes() -> usize {
    10 * 1024
}

fn default_title_max_width() -> usize {
    30
}

fn default_queue_capacity() -> usize {
    64
}

fn default_repo_interval_secs() -> u64 {
    60
}

fn default_branch_every() -> u64 {
    10
}

fn default_hook_timeout_secs() -> u64 {
    30 * 60
}

fn default_hook_soft_timeout_secs() -> u64 {
    5 * 60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            session: default_pool_session(),
            socket: None,
            agent_command: default_agent_command(),
            default_view: None,
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval_secs(),
            idle_threshold_secs: default_idle_threshold_secs(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_scanner_interval_secs(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl ScannerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for TitlesConfig {
    fn default() -> Self {
        Self {
            max_width: default_title_max_width(),
        }
    }
}

impl Default for RepoUpdateConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            interval_secs: default_repo_interval_secs(),
            default_branch_every: default_branch_every(),
            hook_timeout_secs: default_hook_timeout_secs(),
            hook_soft_timeout_secs: default_hook_soft_timeout_secs(),
        }
    }
}

impl RepoUpdateConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    pub fn hook_soft_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_soft_timeout_secs)
    }
}

impl DaemonConfig {
    /// Load the config file at `path`. Returns the default config (and `None`)
    /// when the file does not exist.
    pub fn load(path: &Path) -> Result<(Self, Option<PathBuf>)> {
        if !path.is_file() {
            return Ok((DaemonConfig::default(), None));
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: DaemonConfig = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config in {}", path.display()))?;
        Ok((config, Some(path.to_path_buf())))
    }

    pub fn validate(&self) -> Result<()> {
        if self.reaper.interval_secs == 0
            || self.scanner.interval_secs == 0
            || self.repo_update.interval_secs == 0
        {
            bail!("loop intervals must be at least one second");
        }
        if self.repo_update.queue_capacity == 0 {
            bail!("repo_update.queue_capacity must be at least 1");
        }
        if self.repo_update.hook_soft_timeout_secs == 0 {
            bail!("repo_update.hook_soft_timeout_secs must be at least 1");
        }
        if self.titles.max_width == 0 {
            bail!("titles.max_width must be at least 1");
        }
        let mut seen = HashSet::new();
        for repo in &self.repos {
            if repo.name.trim().is_empty() {
                bail!("repository at {} has an empty name", repo.path.display());
            }
            if !seen.insert(repo.name.as_str()) {
                bail!("repository '{}' is configured twice", repo.name);
            }
        }
        Ok(())
    }

    pub fn repo(&self, name: &str) -> Option<&RepoConfig> {
        self.repos.iter().find(|repo| repo.name == name)
    }
}

/// Where the daemon reads its configuration from on each repo-update cycle.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<DaemonConfig>;
}

/// [`ConfigSource`] that re-reads a TOML file on every call, so edits take
/// effect without a restart.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<DaemonConfig> {
        DaemonConfig::load(&self.path).map(|(config, _)| config)
    }
}

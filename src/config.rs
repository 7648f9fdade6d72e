use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{llog_debug, Error, Result};

pub const DEFAULT_COMMAND: &str = "claude -p";
pub const DEFAULT_MAX_CONCURRENT_AGENTS: usize = 3;
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_ITERATION_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_KILL_GRACE_SECS: u64 = 5;
pub const DEFAULT_AMBIGUITY_THRESHOLD: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent command line; the prompt is appended as the last argument.
    pub command: Option<String>,
    pub max_concurrent_agents: usize,
    pub max_iterations: u32,
    pub iteration_timeout_secs: u64,
    pub kill_grace_secs: u64,
    /// Consecutive ambiguous iterations tolerated before forcing a block.
    pub ambiguity_threshold: u32,
    pub retry_delay_secs: u64,
    /// One merge at a time through a global mutex.
    pub serialize_merges: bool,
    pub base_branch: Option<String>,
    pub worktree_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command: None,
            max_concurrent_agents: DEFAULT_MAX_CONCURRENT_AGENTS,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            iteration_timeout_secs: DEFAULT_ITERATION_TIMEOUT_SECS,
            kill_grace_secs: DEFAULT_KILL_GRACE_SECS,
            ambiguity_threshold: DEFAULT_AMBIGUITY_THRESHOLD,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            serialize_merges: true,
            base_branch: None,
            worktree_dir: None,
        }
    }
}

impl Config {
    pub fn lanekeeper_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".lanekeeper"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::lanekeeper_dir()?.join("config.toml"))
    }

    /// Task board file for a repository, keyed by the repository folder name.
    pub fn board_path(repo_name: &str) -> Result<PathBuf> {
        Ok(Self::lanekeeper_dir()?
            .join("boards")
            .join(format!("{}.json", repo_name)))
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::lanekeeper_dir()?.join("worktrees")),
        }
    }

    pub fn effective_command(&self) -> &str {
        self.command.as_deref().unwrap_or(DEFAULT_COMMAND)
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_agents == 0 {
            return Err(Error::Validation(
                "max_concurrent_agents must be at least 1".to_string(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(Error::Validation(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.effective_command().split_whitespace().next().is_none() {
            return Err(Error::Validation("command must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        llog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            llog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        llog_debug!(
            "Config loaded: command={:?} max_concurrent_agents={} max_iterations={} serialize_merges={}",
            config.command,
            config.max_concurrent_agents,
            config.max_iterations,
            config.serialize_merges
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                llog_debug!("Creating config directory: {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        llog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let worktrees_dir = self.worktrees_dir()?;
        if !worktrees_dir.exists() {
            llog_debug!("Creating worktrees directory: {}", worktrees_dir.display());
            fs::create_dir_all(&worktrees_dir)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

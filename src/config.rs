use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::queue::DEFAULT_MAX_RETRIES;
use crate::core::task::TaskId;
use crate::orchestration::batch::BatchPolicy;
use crate::{Error, Result};

/// Name of the per-project state directory.
pub const STATE_DIR_NAME: &str = ".forgeplan";

const CONFIG_FILE: &str = "forgeplan.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Attempts before a task failure becomes terminal.
    pub max_retries: u32,
    /// Advance through phases without confirmation.
    pub continuous: bool,
    /// Concurrent tasks for the level dispatcher.
    pub max_parallel: usize,
    /// Tasks that always wait for a human before dispatch.
    pub interruption_gates: Vec<TaskId>,
    /// Checkpoints to keep after each run; all are kept when unset.
    pub keep_checkpoints: Option<usize>,
    /// Override for the state directory.
    pub state_dir: Option<String>,
    pub batch: BatchPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            continuous: true,
            max_parallel: 4,
            interruption_gates: Vec::new(),
            keep_checkpoints: None,
            state_dir: None,
            batch: BatchPolicy::default(),
        }
    }
}

impl Config {
    /// Global state directory, used when no project root is given.
    pub fn home_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(STATE_DIR_NAME))
    }

    /// State directory for a project, or the global one.
    pub fn default_state_dir(project: Option<&Path>) -> Result<PathBuf> {
        match project {
            Some(root) => Ok(root.join(STATE_DIR_NAME)),
            None => Self::home_dir(),
        }
    }

    pub fn config_path(state_dir: &Path) -> PathBuf {
        state_dir.join(CONFIG_FILE)
    }

    /// Effective state directory: the `state_dir` override if set,
    /// otherwise the directory the config was loaded from.
    pub fn resolve_state_dir(&self, loaded_from: &Path) -> PathBuf {
        match &self.state_dir {
            Some(dir) => expand_tilde(dir),
            None => loaded_from.to_path_buf(),
        }
    }

    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = Self::config_path(state_dir);
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        debug!(
            max_retries = config.max_retries,
            continuous = config.continuous,
            max_parallel = config.max_parallel,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self, state_dir: &Path) -> Result<()> {
        Self::ensure_dirs(state_dir)?;
        let path = Self::config_path(state_dir);
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs(state_dir: &Path) -> Result<()> {
        if !state_dir.exists() {
            debug!(dir = %state_dir.display(), "creating state directory");
            fs::create_dir_all(state_dir)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(Error::Validation("max_retries must be at least 1".to_string()));
        }
        if self.max_parallel == 0 {
            return Err(Error::Validation("max_parallel must be at least 1".to_string()));
        }
        if self.batch.max_batch_size == 0 || self.batch.max_batch_minutes == 0 {
            return Err(Error::Validation(
                "batch size and time ceiling must be positive".to_string(),
            ));
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

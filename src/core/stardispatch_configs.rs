use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{backends::BackendKind, database::Database};

#[cfg(test)]
mod tests;

pub const STARDISPATCH_DIR: &str = ".stardispatch";
const CONFIG_FILE: &str = "stardispatch.conf";

#[derive(Error, Debug)]
pub enum StardispatchConfigError {
  #[error("Filesystem error: {0}")]
  FilesystemError(#[from] std::io::Error),
  #[error("Could not find .stardispatch directory, run `stardispatch init` first")]
  StardispatchDirNotFound,
  #[error("IO Error: {0}")]
  ConfyError(#[from] confy::ConfyError),
  #[error("Stardispatch config not found")]
  StardispatchConfigNotFound,
  #[error("Invalid configuration: {0}")]
  InvalidConfig(String),
  #[error("Database error: {0}")]
  DatabaseError(#[from] crate::core::database::StorageError),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StardispatchConfig {
  pub backend: BackendKind,
  /// Queue that receives nodes from removed queues; it can never be removed itself.
  pub default_queue: String,
  /// Seconds, used as cpu and wall timeout of newly discovered queues.
  pub default_timeout: i32,
  pub cluster_update_period_secs: u64,
  pub broken_pair_sweep_period_secs: u64,
  pub max_stages_per_pipeline: usize,
}

impl Default for StardispatchConfig {
  fn default() -> Self {
    StardispatchConfig {
      backend: BackendKind::Local,
      default_queue: "all.q".to_string(),
      default_timeout: 259_200,
      cluster_update_period_secs: 600,
      broken_pair_sweep_period_secs: 10_800,
      max_stages_per_pipeline: 10_000,
    }
  }
}

impl StardispatchConfig {
  pub fn validate(&self) -> Result<(), StardispatchConfigError> {
    if self.default_queue.trim().is_empty() {
      return Err(StardispatchConfigError::InvalidConfig(
        "default_queue must not be empty".to_string(),
      ));
    }
    if self.default_timeout <= 0 {
      return Err(StardispatchConfigError::InvalidConfig(format!(
        "default_timeout must be positive, got {}",
        self.default_timeout
      )));
    }
    if self.cluster_update_period_secs == 0 || self.broken_pair_sweep_period_secs == 0 {
      return Err(StardispatchConfigError::InvalidConfig(
        "periods must be at least one second".to_string(),
      ));
    }
    if self.max_stages_per_pipeline == 0 {
      return Err(StardispatchConfigError::InvalidConfig(
        "max_stages_per_pipeline must be at least 1".to_string(),
      ));
    }
    Ok(())
  }
}

/// Initializes the .stardispatch directory at the specified path:
/// - Creates the .stardispatch directory
/// - Writes a default stardispatch.conf unless one exists
/// - Creates the database
pub fn init_stardispatch_dir(path: &Path) -> Result<PathBuf, StardispatchConfigError> {
  let path = path.join(STARDISPATCH_DIR);
  std::fs::create_dir_all(&path)?;
  if !path.join(CONFIG_FILE).is_file() {
    init_stardispatch_config(&path)?;
  }
  Database::new(&path)?;
  Ok(path)
}

/// Searches for the .stardispatch directory starting from the current working directory
/// and moving up the directory tree until it finds it or reaches the user's home directory.
pub fn get_stardispatch_dir() -> Result<PathBuf, StardispatchConfigError> {
  let home = dirs::home_dir().unwrap_or(PathBuf::from("/"));
  let mut dir = std::env::current_dir()?;

  loop {
    let candidate = dir.join(STARDISPATCH_DIR);
    if candidate.is_dir() {
      return Ok(candidate);
    }
    if dir == home || !dir.pop() {
      break;
    }
  }

  Err(StardispatchConfigError::StardispatchDirNotFound)
}

pub fn get_stardispatch_config(path: &Path) -> Result<StardispatchConfig, StardispatchConfigError> {
  if !path.join(CONFIG_FILE).is_file() {
    return Err(StardispatchConfigError::StardispatchConfigNotFound);
  }
  let config: StardispatchConfig = confy::load_path(path.join(CONFIG_FILE))?;
  config.validate()?;
  Ok(config)
}

pub fn init_stardispatch_config(path: &Path) -> Result<(), StardispatchConfigError> {
  confy::store_path(path.join(CONFIG_FILE), StardispatchConfig::default())?;
  Ok(())
}

pub fn set_stardispatch_config(
  path: &Path,
  config: &StardispatchConfig,
) -> Result<(), StardispatchConfigError> {
  config.validate()?;
  confy::store_path(path.join(CONFIG_FILE), config)?;
  Ok(())
}

//! Configuration for the directory cache with per-root overrides.
//!
//! Config priority: root-relative (.dirmirror.toml) > user (~/.config/dirmirror/config.toml) > defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// File name of the per-root config file
pub const ROOT_CONFIG_FILE: &str = ".dirmirror.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("IO error reading {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Invalid config: {0}")]
  Parse(#[from] toml::de::Error),
}

// ============================================================================
// Scan Configuration
// ============================================================================

/// Scanner settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
  /// Entries between progress notifications (default: 256)
  pub progress_interval: usize,
}

impl Default for ScanConfig {
  fn default() -> Self {
    Self { progress_interval: 256 }
  }
}

// ============================================================================
// Watcher Configuration
// ============================================================================

/// Filesystem watcher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
  /// How long a rename-from waits for its rename-to before it is
  /// reported as a delete, in milliseconds (default: 50)
  pub rename_window_ms: u64,

  /// Capacity of the channel between the OS callback and the watcher task (default: 1024)
  pub event_buffer: usize,

  /// Poll interval for notify's polling fallback, in milliseconds (default: 2000)
  pub poll_interval_ms: u64,
}

impl WatcherConfig {
  pub fn rename_window(&self) -> Duration {
    Duration::from_millis(self.rename_window_ms)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }
}

impl Default for WatcherConfig {
  fn default() -> Self {
    Self {
      rename_window_ms: 50,
      event_buffer: 1024,
      poll_interval_ms: 2000,
    }
  }
}

// ============================================================================
// Ignore Configuration
// ============================================================================

/// Ignore rules applied on top of the patterns passed to SetRoot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IgnoreConfig {
  /// Gitignore-style patterns that are always active
  pub patterns: Vec<String>,

  /// Also read `<root>/.gitignore` (default: false)
  pub respect_gitignore: bool,
}

// ============================================================================
// Service Configuration
// ============================================================================

/// Cache service channel sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
  /// Pending commands before `CacheHandle` calls wait (default: 64)
  pub command_buffer: usize,

  /// Notifications retained for slow subscribers (default: 256)
  pub update_buffer: usize,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      command_buffer: 64,
      update_buffer: 256,
    }
  }
}

// ============================================================================
// Top-level Config
// ============================================================================

/// Complete cache configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub scan: ScanConfig,

  #[serde(default)]
  pub watcher: WatcherConfig,

  #[serde(default)]
  pub ignore: IgnoreConfig,

  #[serde(default)]
  pub service: ServiceConfig,
}

impl Config {
  /// Parse a config from TOML text
  pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
    Ok(toml::from_str(content)?)
  }

  /// Read and parse a config file
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_toml_str(&content)
  }

  /// Load config for a root, with fallback to user config
  pub fn load_for_root(root: &Path) -> Self {
    let root_config = Self::root_config_path(root);
    if root_config.exists()
      && let Some(config) = Self::try_load(&root_config)
    {
      return config;
    }

    if let Some(user_config) = Self::user_config_path()
      && user_config.exists()
      && let Some(config) = Self::try_load(&user_config)
    {
      return config;
    }

    Self::default()
  }

  fn try_load(path: &Path) -> Option<Self> {
    match Self::from_file(path) {
      Ok(config) => {
        debug!(path = %path.display(), "Loaded config");
        Some(config)
      }
      Err(e) => {
        warn!(path = %path.display(), error = %e, "Skipping unreadable config");
        None
      }
    }
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("DIRMIRROR_CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }

    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
      return Some(PathBuf::from(path).join("dirmirror").join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("dirmirror").join("config.toml"))
  }

  /// Get the root-relative config path
  pub fn root_config_path(root: &Path) -> PathBuf {
    root.join(ROOT_CONFIG_FILE)
  }

  /// Generate a default config file as a string
  pub fn generate_template() -> String {
    r#"# dirmirror configuration
# Place in <root>/.dirmirror.toml or ~/.config/dirmirror/config.toml

[scan]
# Entries between progress notifications
progress_interval = 256

[watcher]
# How long a rename-from waits for its matching rename-to (ms)
rename_window_ms = 50
# Raw event channel capacity
event_buffer = 1024
# Poll interval when notify falls back to polling (ms)
poll_interval_ms = 2000

[ignore]
# Always-on gitignore-style patterns, e.g. [".git/", "*.log"]
patterns = []
# Also read <root>/.gitignore
respect_gitignore = false

[service]
command_buffer = 64
update_buffer = 256
"#
    .to_string()
  }
}

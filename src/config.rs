//! Registry settings and where they are stored.
//!
//! Config directory priority:
//! 1. CLI `--config-dir`
//! 2. `IMGCACHE_CONFIG_DIR` environment variable
//! 3. Platform config directory from dirs-next
//!
//! Platform paths:
//! - Linux: ~/.config/imgcache/imgcache.json
//! - macOS: ~/Library/Application Support/imgcache/imgcache.json
//! - Windows: %APPDATA%\imgcache\imgcache.json

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::core::workers::default_thread_count;

pub const CONFIG_FILE_NAME: &str = "imgcache.json";
pub const CONFIG_DIR_ENV: &str = "IMGCACHE_CONFIG_DIR";

/// Unreferenced, unmodified entries kept per map before collection kicks in
pub const DEFAULT_EVICTION_FLOOR: usize = 3;

/// What to do with unsaved changes when the user moves to another image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ModifiedBehavior {
    /// Let the caller decide (prompt)
    #[default]
    Ask,
    SaveSilently,
    DiscardChanges,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub eviction_floor: usize,
    pub decoder_threads: usize,
    pub modified_behavior: ModifiedBehavior,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            eviction_floor: DEFAULT_EVICTION_FLOOR,
            decoder_threads: default_thread_count(),
            modified_behavior: ModifiedBehavior::default(),
        }
    }
}

impl RegistryConfig {
    /// Read from JSON. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }
}

/// Override for the default config location
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var → None (platform default)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var(CONFIG_DIR_ENV).ok().map(PathBuf::from));
        Self { config_dir }
    }

    pub fn config_dir(&self) -> PathBuf {
        if let Some(dir) = &self.config_dir {
            return dir.clone();
        }
        dirs_next::config_dir()
            .map(|dir| dir.join("imgcache"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join(CONFIG_FILE_NAME)
    }
}

//! Configuration module for the shent CLI.
//!
//! Loads `shent.toml`, which carries the barrier configuration plus the
//! settings of the simulated runtime.

use dirs::config_dir;
use serde::{Deserialize, Serialize};
use shen_barrier::BarrierConfig;
use std::path::{Path, PathBuf};

use crate::error::{Result, ShentError};

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "shent.toml";

/// Application configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    /// Barrier emission settings.
    #[serde(default)]
    pub barrier: BarrierConfig,

    /// Simulated runtime settings.
    #[serde(default)]
    pub simulate: SimulateConfig,
}

/// Simulated runtime configuration options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulateConfig {
    /// Number of heap regions to map.
    #[serde(default = "default_regions")]
    pub regions: usize,

    /// SATB buffer capacity in entries.
    #[serde(default = "default_satb_entries")]
    pub satb_entries: usize,

    /// Interpreter step limit per run.
    #[serde(default = "default_step_limit")]
    pub step_limit: usize,
}

fn default_regions() -> usize {
    4
}

fn default_satb_entries() -> usize {
    16
}

fn default_step_limit() -> usize {
    100_000
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            regions: default_regions(),
            satb_entries: default_satb_entries(),
            step_limit: default_step_limit(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Searches the current directory, then the user configuration
    /// directory. Returns the default configuration if no file is found.
    pub fn load() -> Result<Self> {
        match Self::find_config_file() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ShentError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| ShentError::Config(format!("Failed to parse configuration: {}", e)))?;

        Ok(config)
    }

    /// Save configuration to a specific path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = self.to_toml()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ShentError::Config(format!("Failed to serialize configuration: {}", e)))
    }

    /// Apply `SHEN_*` environment overrides and validate the result.
    pub fn finalize(mut self) -> Result<Self> {
        self.barrier.apply_env();
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.barrier
            .validate()
            .map_err(|e| ShentError::Config(e.to_string()))?;
        if self.simulate.regions < 2 {
            return Err(ShentError::Config(
                "simulate.regions must be at least 2 (one for holders, one for targets)".to_string(),
            ));
        }
        if self.simulate.satb_entries == 0 {
            return Err(ShentError::Config("simulate.satb_entries must be positive".to_string()));
        }
        Ok(())
    }

    /// Check for config in current directory.
    fn check_current_dir_config() -> Option<PathBuf> {
        let path = PathBuf::from(CONFIG_FILE_NAME);
        path.exists().then_some(path)
    }

    /// Check for config in the user configuration directory.
    fn check_user_config() -> Option<PathBuf> {
        config_dir()
            .map(|dir| dir.join("shent").join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }

    fn find_config_file() -> Option<PathBuf> {
        Self::check_current_dir_config().or_else(Self::check_user_config)
    }
}

//! Broker configuration loaded from and saved to TOML.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use warden_engine::EngineConfig;

use crate::error::{ConformError, Result};

/// Complete broker configuration.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Job engine tuning
    pub engine: EngineConfig,
    /// Periodic conform settings
    pub conform: ConformConfig,
}

/// Periodic conform pass settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConformConfig {
    /// Whether the scheduler submits periodic sweeps
    pub enabled: bool,
    /// Seconds between sweep submissions
    pub interval_secs: u64,
}

impl Default for ConformConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
        }
    }
}

impl ConformConfig {
    /// The sweep cadence as a duration.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl BrokerConfig {
    /// Get the config directory (`~/.warden`)
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn config_dir() -> Result<PathBuf> {
        use dirs::home_dir;
        let home = home_dir().ok_or(ConformError::NoHomeDir)?;
        Ok(home.join(".warden"))
    }

    /// Get the default config file path (`~/.warden/config.toml`)
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load config from the default location (`~/.warden/config.toml`)
    /// If the config doesn't exist, creates it with default values
    ///
    /// # Errors
    /// Returns an error if the config cannot be read or created
    pub fn load_or_create() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            let config = Self::default();
            config.save_to_file(&config_path)?;
            Ok(config)
        }
    }

    /// Load config from a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save config to a specific file
    ///
    /// # Errors
    /// Returns an error if the file cannot be written
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;

        let header = "# Warden Configuration File\n\
                      # This file is automatically generated on first run\n\
                      # Edit this file to customize your settings\n\n";

        fs::write(path, format!("{header}{contents}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert!(config.conform.enabled);
        assert_eq!(config.conform.interval(), Duration::from_secs(300));
        assert_eq!(config.engine.lock_wait_secs, 30);
    }

    #[test]
    /// # Panics
    /// Panics if the round trip through disk fails.
    fn test_config_round_trips_through_disk() {
        let dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("create temp dir: {error}"),
        };
        let path = dir.path().join("nested").join("config.toml");

        let mut config = BrokerConfig::default();
        config.conform.interval_secs = 60;
        config.engine.max_concurrent_tasks = 2;

        if let Err(error) = config.save_to_file(&path) {
            panic!("save failed: {error}");
        }
        let loaded = match BrokerConfig::load_from_file(&path) {
            Ok(loaded) => loaded,
            Err(error) => panic!("load failed: {error}"),
        };

        assert_eq!(loaded.conform.interval_secs, 60);
        assert_eq!(loaded.engine.max_concurrent_tasks, 2);
    }
}

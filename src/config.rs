use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub downloads: DownloadsConfig,
    pub history: HistoryConfig,
}

/// Durable store location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the database file (empty = default data dir)
    pub data_dir: Option<String>,
}

/// Offline download settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadsConfig {
    /// Maximum concurrent video transfers
    pub max_concurrent: usize,
    /// Video directory (empty = default data dir)
    pub download_dir: Option<String>,
}

impl Default for DownloadsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            download_dir: None,
        }
    }
}

/// Workout history settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Whether a day with no logged workout yet counts as "still open" when
    /// computing the streak, instead of breaking it at today
    pub count_open_day: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            count_open_day: true,
        }
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("stride");

        fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path).context("Failed to read config file")?;

            let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

            Ok(config)
        } else {
            // Create default config and save it
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents).context("Failed to write config file")?;

        Ok(())
    }
}

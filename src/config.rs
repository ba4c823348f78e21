//! Configuration module for the order notifier.
//!
//! Handles loading and saving application settings from JSON file.
//! Sound settings are not kept here: they live in the shared store so
//! every context plays the same cue.

use crate::watcher::WatcherOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const APP_DIR: &str = "orderbell";
const CONFIG_FILE: &str = "config.json";

/// Errors that can occur while saving the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Main application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory of the shared store.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
    /// Store key of the watched collection.
    #[serde(default = "default_collection_key")]
    pub collection_key: String,
    /// Poll interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Storage event scan interval in milliseconds.
    #[serde(default = "default_event_scan_interval")]
    pub event_scan_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            collection_key: default_collection_key(),
            poll_interval_ms: default_poll_interval(),
            event_scan_interval_ms: default_event_scan_interval(),
        }
    }
}

impl AppConfig {
    /// Watcher options derived from this configuration.
    pub fn watcher_options(&self) -> WatcherOptions {
        WatcherOptions {
            collection_key: self.collection_key.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn event_scan_interval(&self) -> Duration {
        Duration::from_millis(self.event_scan_interval_ms)
    }
}

// Default value functions for serde
fn default_store_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR).join("store"))
        .unwrap_or_else(|| PathBuf::from("store"))
}
fn default_collection_key() -> String {
    "orders".to_string()
}
fn default_poll_interval() -> u64 {
    2000
}
fn default_event_scan_interval() -> u64 {
    250
}

/// Configuration manager.
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Creates a configuration manager for the default location.
    pub fn new() -> Self {
        Self::with_path(Self::get_config_path())
    }

    /// Creates a configuration manager for an explicit file.
    pub fn with_path(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
        }
    }

    /// Gets the default path to the configuration file.
    fn get_config_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            return config_dir.join(APP_DIR).join(CONFIG_FILE);
        }
        // Fallback to current directory
        PathBuf::from(CONFIG_FILE)
    }

    /// Loads configuration from file.
    ///
    /// If the file doesn't exist, creates it with default values.
    pub fn load(&self) -> AppConfig {
        if !self.config_path.exists() {
            let config = AppConfig::default();
            if let Err(e) = self.save(&config) {
                log::warn!("Failed to write default config: {}", e);
            }
            return config;
        }

        match fs::read_to_string(&self.config_path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                log::warn!("Failed to parse config: {}, using defaults", e);
                AppConfig::default()
            }),
            Err(e) => {
                log::warn!("Failed to read config: {}, using defaults", e);
                AppConfig::default()
            }
        }
    }

    /// Saves configuration to file.
    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.config_path, content)?;
        Ok(())
    }

    /// Returns the config file path.
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

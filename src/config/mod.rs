//! Configuration module for beamview
//!
//! This module handles the pipeline configuration file. The format follows
//! the file extension: `.toml` (primary) or `.json`.
//!
//! # Config Location
//!
//! Without an explicit path the configuration is read from the
//! platform-appropriate config directory under `dev.beamview.beamview`:
//!
//! - **Linux**: `~/.config/dev.beamview.beamview/config.toml`
//! - **macOS**: `~/Library/Application Support/dev.beamview.beamview/config.toml`
//! - **Windows**: `%APPDATA%\dev.beamview.beamview\config.toml`
//!
//! # Example
//!
//! ```toml
//! [buffer]
//! capacity = 2048
//! max_age_secs = 600.0
//!
//! [controller]
//! worker_threads = 4
//!
//! [reduction]
//! skip_non_finite = true
//!
//! [reduction.recipe]
//! operation = "sum"
//! roi = { region = { row = 100, col = 120, rows = 32, cols = 32 } }
//! normalization = "monitor"
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{BeamViewError, Result, ResultExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "dev.beamview.beamview";

/// Config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Get the default config file path
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID).join(CONFIG_FILE))
}

/// Supported on-disk formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Toml,
        }
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub buffer: BufferSettings,
    pub controller: ControllerSettings,
    pub reduction: ReductionSettings,
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BeamViewError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: AppConfig = match ConfigFormat::from_path(path) {
            ConfigFormat::Toml => toml::from_str(&content).map_err(|e| {
                BeamViewError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })?,
            ConfigFormat::Json => serde_json::from_str(&content).map_err(|e| {
                BeamViewError::Config(format!("Failed to parse config file {:?}: {}", path, e))
            })?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` (or the default location), returning defaults on any error
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
            Some(p) => p,
            None => return Self::default(),
        };
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Self::default();
        }
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config to disk, format chosen by extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        let content = match ConfigFormat::from_path(path) {
            ConfigFormat::Toml => toml::to_string_pretty(self)
                .map_err(|e| BeamViewError::Serialization(e.to_string()))?,
            ConfigFormat::Json => serde_json::to_string_pretty(self)?,
        };

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file {:?}", path))
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.buffer.capacity == 0 {
            return Err(BeamViewError::Config(
                "buffer.capacity must be at least 1".to_string(),
            ));
        }
        if let Some(secs) = self.buffer.max_age_secs {
            if !(secs.is_finite() && secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok()) {
                return Err(BeamViewError::Config(format!(
                    "buffer.max_age_secs must be a positive number of seconds, got {}",
                    secs
                )));
            }
        }
        if self.controller.worker_threads == 0 {
            return Err(BeamViewError::Config(
                "controller.worker_threads must be at least 1".to_string(),
            ));
        }
        if self.controller.map_shards == 0 {
            return Err(BeamViewError::Config(
                "controller.map_shards must be at least 1".to_string(),
            ));
        }
        if self.controller.notify_capacity == 0 {
            return Err(BeamViewError::Config(
                "controller.notify_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

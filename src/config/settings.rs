//! Configuration sections
//!
//! Each section maps to a table in the config file. Every field has a default,
//! so a partial file (or none at all) yields a working configuration.
//!
//! # Main Types
//!
//! - [`BufferSettings`] - Frame buffer capacity and age limit
//! - [`ControllerSettings`] - Worker pool, map sharding, notification queue depth
//! - [`ReductionSettings`] - Live recipe and masked-pixel handling
//! - [`LoggingSettings`] - Log filter and optional log directory

use crate::pipeline::bridge::DEFAULT_NOTIFY_CAPACITY;
use crate::pipeline::reduction::ReductionRecipe;
use crate::pipeline::scan_map::DEFAULT_SHARDS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default number of frames retained by the buffer
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Default number of reduction worker threads
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// Default tracing filter directive
pub const DEFAULT_LOG_FILTER: &str = "info,beamview=debug";

/// Frame buffer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSettings {
    /// Maximum number of frames kept in memory
    pub capacity: usize,

    /// Drop frames older than this many seconds on admission
    pub max_age_secs: Option<f64>,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUFFER_CAPACITY,
            max_age_secs: None,
        }
    }
}

impl BufferSettings {
    /// Age limit as a duration, ignoring non-positive, non-finite or
    /// unrepresentable values.
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs
            .filter(|s| s.is_finite() && *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }
}

/// Live controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Number of reduction worker threads
    pub worker_threads: usize,

    /// Shards in the live scan map
    pub map_shards: usize,

    /// Per-subscriber notification queue depth
    pub notify_capacity: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            map_shards: DEFAULT_SHARDS,
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }
}

/// Reduction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReductionSettings {
    /// Recipe applied to live frames at startup
    pub recipe: ReductionRecipe,

    /// Ignore NaN/inf pixels (masked detector gaps) instead of discarding the frame
    pub skip_non_finite: bool,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,

    /// Write daily-rotated log files here in addition to stderr
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            directory: None,
        }
    }
}

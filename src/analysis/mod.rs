//! Analysis module for reduced maps
//!
//! This module provides summary tools over map snapshots:
//! - Value statistics (min, max, mean, standard deviation)
//! - Fill counts
//! - Percentile display range for colour-map auto-scaling

pub mod map_stats;

pub use map_stats::{MapStatistics, DEFAULT_DISPLAY_PERCENTILES};

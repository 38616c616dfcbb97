//! # beamview: live detector frame reduction and scan mapping
//!
//! The pipeline behind a beamline mapping view. Frames arrive from a detector
//! while a sample stage scans; each frame is reduced to a number (integrated
//! intensity, mean, maximum or peak position) and placed in a 2D map at the
//! stage coordinate it was taken at. The map updates live while acquisition
//! runs, and buffered frames can be re-reduced with a different recipe without
//! disturbing it.
//!
//! ## Architecture
//!
//! - **Pipeline**: frame buffer, reduction engine, sharded scan map, live
//!   controller with a worker pool, and batch post-processor
//! - **Acquisition**: a simulated detector for running without hardware
//! - **Analysis**: map statistics for colour-map scaling
//! - **Communication**: crossbeam channels carrying map generations
//!
//! ## Configuration
//!
//! Settings are read from the platform-appropriate config directory under
//! `dev.beamview.beamview`:
//!
//! - **Linux**: `~/.config/dev.beamview.beamview/config.toml`
//! - **macOS**: `~/Library/Application Support/dev.beamview.beamview/config.toml`
//! - **Windows**: `%APPDATA%\dev.beamview.beamview\config.toml`
//!
//! ## Example
//!
//! ```ignore
//! use beamview::{
//!     acquisition::MockDetector,
//!     config::AppConfig,
//!     pipeline::LiveController,
//! };
//!
//! let config = AppConfig::load_or_default(None);
//! let controller = LiveController::new(&config)?;
//! let updates = controller.subscribe();
//! controller.start()?;
//!
//! for frame in MockDetector::new(64, 64).with_scan(20, 20) {
//!     controller.submit(frame)?;
//! }
//!
//! while let Ok(notification) = updates.recv() {
//!     let snapshot = controller.get_latest_map();
//!     // redraw from snapshot
//! }
//! ```

pub mod acquisition;
pub mod analysis;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod types;

// Re-export commonly used types
pub use acquisition::MockDetector;
pub use analysis::MapStatistics;
pub use config::AppConfig;
pub use error::{BeamViewError, Result, ResultExt};
pub use pipeline::{
    FrameBuffer, LiveController, MapSnapshot, PipelineError, PostProcessor, ReductionEngine,
    ReductionRecipe, ScanMap,
};
pub use types::{Coordinate, Frame, FrameData, FrameStatus, FrameSubmission};

//! Test data builders for creating frames and configurations

use beamview::config::AppConfig;
use beamview::pipeline::ReductionRecipe;
use beamview::types::{Coordinate, FrameData, FrameSubmission};
use std::time::Duration;

/// Builder for creating test frame submissions
pub struct FrameBuilder {
    rows: usize,
    cols: usize,
    value: f64,
    position: Coordinate,
    timestamp: Duration,
    monitor: Option<f64>,
    pixels: Option<Vec<f64>>,
}

impl FrameBuilder {
    /// A 4×4 all-ones frame at (0, 0)
    pub fn new() -> Self {
        Self {
            rows: 4,
            cols: 4,
            value: 1.0,
            position: Coordinate::new(0, 0),
            timestamp: Duration::ZERO,
            monitor: None,
            pixels: None,
        }
    }

    pub fn shape(mut self, rows: usize, cols: usize) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    pub fn value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    pub fn pixels(mut self, pixels: Vec<f64>) -> Self {
        self.pixels = Some(pixels);
        self
    }

    pub fn at(mut self, row: i32, col: i32) -> Self {
        self.position = Coordinate::new(row, col);
        self
    }

    pub fn timestamp_ms(mut self, ms: u64) -> Self {
        self.timestamp = Duration::from_millis(ms);
        self
    }

    pub fn monitor(mut self, counts: f64) -> Self {
        self.monitor = Some(counts);
        self
    }

    pub fn data(&self) -> FrameData {
        match &self.pixels {
            Some(pixels) => FrameData::new(self.rows, self.cols, pixels.clone()).unwrap(),
            None => FrameData::filled(self.rows, self.cols, self.value).unwrap(),
        }
    }

    pub fn build(self) -> FrameSubmission {
        let submission = FrameSubmission::new(self.data(), self.position, self.timestamp);
        match self.monitor {
            Some(counts) => submission.with_monitor(counts),
            None => submission,
        }
    }
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Config with `workers` reduction threads and the given live recipe
pub fn config_with(workers: usize, recipe: ReductionRecipe) -> AppConfig {
    let mut config = AppConfig::default();
    config.controller.worker_threads = workers;
    config.reduction.recipe = recipe;
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_builder() {
        let frame = FrameBuilder::new().shape(2, 3).value(5.0).at(1, 2).build();
        assert_eq!(frame.data.rows(), 2);
        assert_eq!(frame.data.cols(), 3);
        assert_eq!(frame.data.get(1, 2), Some(5.0));
        assert_eq!(frame.position, Coordinate::new(1, 2));
        assert_eq!(frame.monitor, None);
    }
}

//! Simulated area detector for running the pipeline without hardware
//!
//! [`MockDetector`] produces one frame per point of a rectangular raster scan.
//! Each frame is a synthetic detector image chosen by a [`DetectorPattern`];
//! the default is a Gaussian diffraction spot over a flat background whose
//! intensity follows a smooth "sample" feature centred in the scan area, so
//! the reduced map shows a recognisable blob.
//!
//! # Determinism
//!
//! Noise comes from a per-detector xorshift generator seeded at construction.
//! Two detectors built with the same settings emit bit-identical frames.
//!
//! # Example
//!
//! ```ignore
//! use beamview::acquisition::{MockDetector, DetectorPattern};
//!
//! let detector = MockDetector::new(64, 64)
//!     .with_scan(20, 30)
//!     .with_noise(0.5)
//!     .with_monitor(1.0e5);
//!
//! for submission in detector {
//!     controller.submit(submission)?;
//! }
//! ```

use crate::types::{Coordinate, FrameData, FrameSubmission};
use std::time::Duration;

/// Image generated for each scan point
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetectorPattern {
    /// Every pixel holds the same value
    Constant(f64),
    /// Gaussian spot at the frame centre over a flat background
    GaussianSpot {
        amplitude: f64,
        sigma: f64,
        background: f64,
    },
    /// Pixel value equals its row-major index (handy for ROI tests)
    Ramp,
}

impl Default for DetectorPattern {
    fn default() -> Self {
        DetectorPattern::GaussianSpot {
            amplitude: 1000.0,
            sigma: 3.0,
            background: 10.0,
        }
    }
}

/// Order in which scan positions are visited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanOrder {
    /// Every row left to right
    #[default]
    Raster,
    /// Alternate rows reversed, as a snake-scanning stage moves
    Serpentine,
}

/// Synthetic frame source over a `scan_rows × scan_cols` raster
#[derive(Debug, Clone)]
pub struct MockDetector {
    rows: usize,
    cols: usize,
    scan_rows: usize,
    scan_cols: usize,
    order: ScanOrder,
    pattern: DetectorPattern,
    noise_amplitude: f64,
    monitor: Option<f64>,
    frame_interval: Duration,
    next_index: usize,
    seed: u64,
    rng_state: u64,
}

impl MockDetector {
    /// Detector producing `rows × cols` frames over a 10 × 10 scan
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            scan_rows: 10,
            scan_cols: 10,
            order: ScanOrder::default(),
            pattern: DetectorPattern::default(),
            noise_amplitude: 0.0,
            monitor: None,
            frame_interval: Duration::from_millis(10),
            next_index: 0,
            seed: 12345,
            rng_state: 12345,
        }
    }

    pub fn with_scan(mut self, scan_rows: usize, scan_cols: usize) -> Self {
        self.scan_rows = scan_rows;
        self.scan_cols = scan_cols;
        self
    }

    pub fn with_order(mut self, order: ScanOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_pattern(mut self, pattern: DetectorPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Add uniform noise in `[-amplitude, amplitude]` to every pixel
    pub fn with_noise(mut self, amplitude: f64) -> Self {
        self.noise_amplitude = amplitude;
        self
    }

    /// Attach a monitor (I0) reading to every frame
    pub fn with_monitor(mut self, counts: f64) -> Self {
        self.monitor = Some(counts);
        self
    }

    /// Spacing of the synthetic timestamps
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        // xorshift must not start at zero
        self.seed = seed.max(1);
        self.rng_state = self.seed;
        self
    }

    /// Number of frames in one pass over the scan
    pub fn scan_len(&self) -> usize {
        self.scan_rows * self.scan_cols
    }

    /// Frames still to come in this pass
    pub fn remaining(&self) -> usize {
        self.scan_len().saturating_sub(self.next_index)
    }

    /// Scan coordinate of the `index`-th frame
    pub fn position_of(&self, index: usize) -> Option<Coordinate> {
        if index >= self.scan_len() {
            return None;
        }
        let row = index / self.scan_cols;
        let mut col = index % self.scan_cols;
        if self.order == ScanOrder::Serpentine && row % 2 == 1 {
            col = self.scan_cols - 1 - col;
        }
        Some(Coordinate::new(row as i32, col as i32))
    }

    /// Restart the scan and the noise sequence
    pub fn reset(&mut self) {
        self.next_index = 0;
        self.rng_state = self.seed;
    }

    /// Produce the next frame of the scan, or `None` when the pass is done
    pub fn next_frame(&mut self) -> Option<FrameSubmission> {
        let position = self.position_of(self.next_index)?;
        let timestamp = self.frame_interval * self.next_index as u32;
        self.next_index += 1;

        let response = self.sample_response(position);
        let (rows, cols) = (self.rows, self.cols);
        let pattern = self.pattern;
        let noise = self.noise_amplitude;

        let data = FrameData::from_fn(rows, cols, |r, c| {
            let base = match pattern {
                DetectorPattern::Constant(v) => v,
                DetectorPattern::GaussianSpot {
                    amplitude,
                    sigma,
                    background,
                } => {
                    let dr = r as f64 - (rows as f64 - 1.0) / 2.0;
                    let dc = c as f64 - (cols as f64 - 1.0) / 2.0;
                    let spot = (-(dr * dr + dc * dc) / (2.0 * sigma * sigma)).exp();
                    background + amplitude * response * spot
                }
                DetectorPattern::Ramp => (r * cols + c) as f64,
            };
            if noise > 0.0 {
                base + (self.next_random() - 0.5) * 2.0 * noise
            } else {
                base
            }
        });

        let data = match data {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("Mock detector cannot build a {}x{} frame: {}", rows, cols, e);
                return None;
            }
        };

        tracing::trace!("Mock frame {} at {}", self.next_index - 1, position);
        let submission = FrameSubmission::new(data, position, timestamp);
        Some(match self.monitor {
            Some(counts) => submission.with_monitor(counts),
            None => submission,
        })
    }

    /// Smooth feature centred in the scan area, 1.0 at the centre
    fn sample_response(&self, position: Coordinate) -> f64 {
        let half_r = (self.scan_rows as f64 - 1.0) / 2.0;
        let half_c = (self.scan_cols as f64 - 1.0) / 2.0;
        let width = (self.scan_rows.min(self.scan_cols) as f64 / 4.0).max(1.0);
        let dr = position.row as f64 - half_r;
        let dc = position.col as f64 - half_c;
        (-(dr * dr + dc * dc) / (2.0 * width * width)).exp()
    }

    fn next_random(&mut self) -> f64 {
        let mut s = self.rng_state;
        s ^= s << 13;
        s ^= s >> 7;
        s ^= s << 17;
        self.rng_state = s;
        (s as f64) / (u64::MAX as f64)
    }
}

impl Iterator for MockDetector {
    type Item = FrameSubmission;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}

//! Core data types for beamview
//!
//! This module contains the fundamental data structures shared by every
//! pipeline stage: detector frames, their metadata, and scan coordinates.
//!
//! # Main Types
//!
//! - [`Coordinate`] - Grid index of a scan point
//! - [`FrameData`] - Immutable row-major detector image
//! - [`FrameSubmission`] - A frame as handed over by acquisition, before admission
//! - [`Frame`] - An admitted frame: shared pixel data plus metadata and status
//!
//! # Ownership
//!
//! Pixel data is wrapped in an `Arc` on admission and never mutated afterwards.
//! Reductions borrow it for the duration of a call; only the frame buffer
//! changes a frame's [`FrameStatus`].

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::SequenceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Grid index of a scan point (slow axis = `row`, fast axis = `col`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Coordinate {
    pub row: i32,
    pub col: i32,
}

impl Coordinate {
    pub const fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row, self.col)
    }
}

impl From<(i32, i32)> for Coordinate {
    fn from((row, col): (i32, i32)) -> Self {
        Self { row, col }
    }
}

/// Lifecycle state of an admitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FrameStatus {
    /// Admitted, not yet reduced
    #[default]
    Raw,
    /// Reduced successfully at least once
    Reduced,
    /// Reduction failed; the frame contributes no data
    Discarded,
}

/// Row-major 2D detector image.
#[derive(Clone, PartialEq)]
pub struct FrameData {
    rows: usize,
    cols: usize,
    pixels: Vec<f64>,
}

impl FrameData {
    /// Wrap a row-major pixel vector. Fails if the length does not match the shape
    /// or the shape is empty.
    pub fn new(rows: usize, cols: usize, pixels: Vec<f64>) -> PipelineResult<Self> {
        if rows == 0 || cols == 0 {
            return Err(PipelineError::InvalidFrame(format!(
                "empty frame shape {}x{}",
                rows, cols
            )));
        }
        let expected = rows.checked_mul(cols).ok_or_else(|| {
            PipelineError::InvalidFrame(format!("frame shape {}x{} overflows", rows, cols))
        })?;
        if pixels.len() != expected {
            return Err(PipelineError::InvalidFrame(format!(
                "expected {} pixels for {}x{}, got {}",
                expected,
                rows,
                cols,
                pixels.len()
            )));
        }
        Ok(Self { rows, cols, pixels })
    }

    /// A frame with every pixel set to `value`.
    pub fn filled(rows: usize, cols: usize, value: f64) -> PipelineResult<Self> {
        Self::new(rows, cols, vec![value; rows.saturating_mul(cols)])
    }

    /// Build a frame by evaluating `f(row, col)` for each pixel.
    pub fn from_fn(
        rows: usize,
        cols: usize,
        mut f: impl FnMut(usize, usize) -> f64,
    ) -> PipelineResult<Self> {
        let mut pixels = Vec::with_capacity(rows.saturating_mul(cols));
        for r in 0..rows {
            for c in 0..cols {
                pixels.push(f(r, c));
            }
        }
        Self::new(rows, cols, pixels)
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Pixel at `(row, col)`, or `None` outside the frame.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row < self.rows && col < self.cols {
            Some(self.pixels[row * self.cols + col])
        } else {
            None
        }
    }

    /// Slice of `len` pixels in `row` starting at `col`. Caller guarantees bounds.
    #[inline]
    pub(crate) fn row_span(&self, row: usize, col: usize, len: usize) -> &[f64] {
        let start = row * self.cols + col;
        &self.pixels[start..start + len]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.pixels
    }
}

impl fmt::Debug for FrameData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameData")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}

/// A frame as delivered by the acquisition side.
#[derive(Debug, Clone)]
pub struct FrameSubmission {
    pub data: FrameData,
    pub position: Coordinate,
    /// Time since acquisition start
    pub timestamp: Duration,
    /// Incident-beam monitor counts (I0), if the beamline provides them
    pub monitor: Option<f64>,
}

impl FrameSubmission {
    pub fn new(data: FrameData, position: Coordinate, timestamp: Duration) -> Self {
        Self {
            data,
            position,
            timestamp,
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: f64) -> Self {
        self.monitor = Some(monitor);
        self
    }
}

/// Acquisition metadata of an admitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameMetadata {
    pub sequence_id: SequenceId,
    pub position: Coordinate,
    pub timestamp: Duration,
    pub monitor: Option<f64>,
}

/// An admitted frame: shared pixel data, metadata and the status at the time
/// it was read from the buffer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub meta: FrameMetadata,
    pub data: Arc<FrameData>,
    pub status: FrameStatus,
}

impl Frame {
    #[inline]
    pub fn sequence_id(&self) -> SequenceId {
        self.meta.sequence_id
    }

    #[inline]
    pub fn position(&self) -> Coordinate {
        self.meta.position
    }
}

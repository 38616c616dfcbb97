//! Pipeline-specific error types.

use crate::pipeline::id::SequenceId;
use crate::pipeline::post_processor::BatchResult;
use crate::types::Coordinate;
use thiserror::Error;

/// Why a single frame could not be reduced.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReductionError {
    #[error("ROI {roi} exceeds frame bounds {rows}x{cols}")]
    RoiOutOfBounds {
        roi: String,
        rows: usize,
        cols: usize,
    },

    #[error("frame {0} was discarded")]
    FrameDiscarded(SequenceId),

    #[error("non-finite pixel at ({row}, {col})")]
    CorruptPixel { row: usize, col: usize },

    #[error("no finite pixels inside the ROI")]
    NoFinitePixels,

    #[error("monitor normalization requested but frame has no usable monitor value")]
    MissingMonitor,
}

/// Errors that can occur within the pipeline system.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Admission failed: {0}")]
    Admission(String),

    #[error("Reduction failed: {0}")]
    Reduction(#[from] ReductionError),

    #[error("Controller is stopped")]
    ControllerStopped,

    #[error("Stale update at {coordinate}: {incoming} is older than stored {stored}")]
    StaleUpdateRejected {
        coordinate: Coordinate,
        incoming: SequenceId,
        stored: SequenceId,
    },

    #[error("Frame {0} was evicted before it could be read")]
    SkippedFrame(SequenceId),

    #[error("Batch cancelled after {} frames", .partial.processed)]
    BatchCancelled { partial: Box<BatchResult> },

    #[error("Frame {0} not found")]
    NotFound(SequenceId),

    #[error("Invalid recipe: {0}")]
    InvalidRecipe(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid transition from {from} via {action}")]
    InvalidTransition { from: &'static str, action: &'static str },

    #[error("Batch worker panicked")]
    BatchPanicked,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

//! Live mapping pipeline.
//!
//! Frames flow from acquisition into the [`FrameBuffer`], are reduced to a
//! scalar (or peak) by the [`ReductionEngine`] and folded into the [`ScanMap`]
//! by coordinate. Consumers are told about new data through [`MapNotifier`]
//! channels and pull snapshots themselves.
//!
//! # Architecture
//!
//! ```text
//! acquisition ──submit──► [LiveController] ──► [FrameBuffer]
//!                              │
//!                        worker threads ──► [ReductionEngine] ──► [ScanMap]
//!                                                                   │
//!                                              [MapNotifier] ◄──────┘
//!
//! [PostProcessor] ──reads──► [FrameBuffer] ──► fresh ScanMap ──► BatchResult
//! ```
//!
//! # Design
//!
//! - **Sequence ids**: admission order, strictly increasing, used for
//!   last-writer-wins per coordinate.
//! - **Shared frames**: frame data is immutable and shared by `Arc`; only the
//!   buffer changes a frame's status.
//! - **Sharded map**: one `RwLock` per shard; a global generation counter
//!   versions every write.
//! - **Pull-based updates**: notifications carry a generation only.
//! - **Batch isolation**: the post-processor never writes the live map.

pub mod bridge;
pub mod controller;
pub mod error;
pub mod frame_buffer;
pub mod id;
pub mod post_processor;
pub mod reduction;
pub mod scan_map;

pub use bridge::{MapNotification, MapNotifier, DEFAULT_NOTIFY_CAPACITY};
pub use controller::{ControllerState, ControllerStats, LiveController};
pub use error::{PipelineError, PipelineResult, ReductionError};
pub use frame_buffer::{EvictionPolicy, FrameBuffer, FrameIter, PinnedFrame};
pub use id::{BatchId, Generation, RecipeId, SequenceId};
pub use post_processor::{
    BatchHandle, BatchResult, BatchStatus, CancelToken, FailedFrame, FrameRange, PostProcessor,
    SkipReason, SkippedFrame,
};
pub use reduction::{
    Divisor, Normalization, Quantity, ReducedValue, ReductionEngine, ReductionRecipe, Region, Roi,
};
pub use scan_map::{MapCell, MapGrid, MapSnapshot, ScanMap, DEFAULT_SHARDS, MAX_GRID_CELLS};

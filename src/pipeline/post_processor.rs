//! Batch recomputation of a scan map from buffered frames.
//!
//! A batch run walks the frames retained in the [`FrameBuffer`], reduces each
//! one with its own recipe and writes into a fresh [`ScanMap`]. The live map is
//! never touched. Only the frame currently being reduced is pinned, so live
//! eviction keeps working while a batch runs.
//!
//! Runs can be synchronous ([`PostProcessor::run`]) or on a background thread
//! ([`PostProcessor::start_batch`]) with poll and cancel through the returned
//! [`BatchHandle`]. Cancellation is checked between frames.

use crate::config::AppConfig;
use crate::pipeline::error::{PipelineError, PipelineResult, ReductionError};
use crate::pipeline::frame_buffer::FrameBuffer;
use crate::pipeline::id::{BatchId, SequenceId};
use crate::pipeline::reduction::{ReductionEngine, ReductionRecipe};
use crate::pipeline::scan_map::{MapSnapshot, ScanMap, DEFAULT_SHARDS};
use crate::types::Coordinate;
use serde::Serialize;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

/// Which sequence ids a batch covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameRange {
    /// Everything admitted so far
    #[default]
    All,
    /// `first..=last`
    Span { first: SequenceId, last: SequenceId },
}

impl FrameRange {
    /// Inclusive span; the ends are swapped if given in reverse.
    pub fn new(first: SequenceId, last: SequenceId) -> Self {
        if first <= last {
            FrameRange::Span { first, last }
        } else {
            FrameRange::Span {
                first: last,
                last: first,
            }
        }
    }

    /// Clip to ids that have actually been handed out.
    fn resolve(&self, high_water: Option<SequenceId>) -> Option<RangeInclusive<SequenceId>> {
        let high_water = high_water?;
        let (first, last) = match *self {
            FrameRange::All => (SequenceId::FIRST, high_water),
            FrameRange::Span { first, last } => {
                (first.max(SequenceId::FIRST), last.min(high_water))
            }
        };
        (first <= last).then_some(first..=last)
    }
}

/// Why a frame in range was not reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    /// Gone from the buffer when the run started
    EvictedBeforeRun,
    /// Evicted after the run started but before it was read
    EvictedDuringRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SkippedFrame {
    pub sequence_id: SequenceId,
    pub reason: SkipReason,
}

impl From<SkippedFrame> for PipelineError {
    fn from(skipped: SkippedFrame) -> Self {
        PipelineError::SkippedFrame(skipped.sequence_id)
    }
}

/// A frame whose reduction failed during a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedFrame {
    pub sequence_id: SequenceId,
    pub position: Coordinate,
    pub error: ReductionError,
}

/// Outcome of a batch run.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub recipe: ReductionRecipe,
    /// The recomputed map; `complete` is false if the run was cancelled
    pub snapshot: MapSnapshot,
    /// Frames reduced successfully
    pub processed: usize,
    pub skipped: Vec<SkippedFrame>,
    pub failed: Vec<FailedFrame>,
}

impl BatchResult {
    pub fn is_complete(&self) -> bool {
        self.snapshot.complete
    }
}

/// Progress of a background batch.
#[derive(Debug, Clone)]
pub enum BatchStatus {
    Running { processed: usize, total: usize },
    Completed(Box<BatchResult>),
    Cancelled(Box<BatchResult>),
}

impl BatchStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, BatchStatus::Running { .. })
    }
}

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle to a background batch run.
pub struct BatchHandle {
    id: BatchId,
    cancel: CancelToken,
    status: Arc<Mutex<BatchStatus>>,
    thread: Option<JoinHandle<()>>,
}

impl BatchHandle {
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Ask the run to stop after the frame it is on.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn poll(&self) -> BatchStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until the run ends. A cancelled run yields
    /// [`PipelineError::BatchCancelled`] carrying the partial result.
    pub fn wait(mut self) -> PipelineResult<BatchResult> {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                return Err(PipelineError::BatchPanicked);
            }
        }
        match self.poll() {
            BatchStatus::Completed(result) => Ok(*result),
            BatchStatus::Cancelled(partial) => Err(PipelineError::BatchCancelled { partial }),
            BatchStatus::Running { .. } => Err(PipelineError::BatchPanicked),
        }
    }
}

impl Drop for BatchHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.cancel.cancel();
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for BatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchHandle").field("id", &self.id).finish()
    }
}

/// Runs batch reductions over a frame buffer.
pub struct PostProcessor {
    buffer: Arc<FrameBuffer>,
    engine: ReductionEngine,
    map_shards: usize,
    next_id: AtomicU32,
}

impl PostProcessor {
    pub fn new(buffer: Arc<FrameBuffer>) -> Self {
        Self {
            buffer,
            engine: ReductionEngine::new(),
            map_shards: DEFAULT_SHARDS,
            next_id: AtomicU32::new(1),
        }
    }

    /// Post-processor reducing the way the live controller built from `config` does.
    pub fn from_config(buffer: Arc<FrameBuffer>, config: &AppConfig) -> Self {
        Self::new(buffer)
            .with_engine(
                ReductionEngine::new().with_skip_non_finite(config.reduction.skip_non_finite),
            )
            .with_map_shards(config.controller.map_shards)
    }

    pub fn with_engine(mut self, engine: ReductionEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_map_shards(mut self, shards: usize) -> Self {
        self.map_shards = shards;
        self
    }

    /// Run a batch on the calling thread.
    pub fn run(
        &self,
        recipe: &ReductionRecipe,
        range: FrameRange,
        cancel: &CancelToken,
    ) -> BatchResult {
        self.run_with_progress(recipe, range, cancel, |_, _| {})
    }

    /// Like [`run`](Self::run), calling `progress(done, total)` before each
    /// frame and once more when the run completes.
    pub fn run_with_progress(
        &self,
        recipe: &ReductionRecipe,
        range: FrameRange,
        cancel: &CancelToken,
        progress: impl FnMut(usize, usize),
    ) -> BatchResult {
        run_batch(
            &self.buffer,
            self.engine,
            self.map_shards,
            recipe,
            range,
            cancel,
            progress,
        )
    }

    /// Run a batch on a background thread.
    pub fn start_batch(
        &self,
        recipe: ReductionRecipe,
        range: FrameRange,
    ) -> PipelineResult<BatchHandle> {
        let id = BatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancelToken::new();
        let status = Arc::new(Mutex::new(BatchStatus::Running { processed: 0, total: 0 }));

        let buffer = Arc::clone(&self.buffer);
        let engine = self.engine;
        let shards = self.map_shards;
        let thread_cancel = cancel.clone();
        let thread_status = Arc::clone(&status);

        let thread = std::thread::Builder::new()
            .name(format!("beamview-{}", id))
            .spawn(move || {
                let result = run_batch(
                    &buffer,
                    engine,
                    shards,
                    &recipe,
                    range,
                    &thread_cancel,
                    |done, total| {
                        *thread_status
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) =
                            BatchStatus::Running { processed: done, total };
                    },
                );
                let finished = if result.is_complete() {
                    BatchStatus::Completed(Box::new(result))
                } else {
                    BatchStatus::Cancelled(Box::new(result))
                };
                *thread_status
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = finished;
            })?;

        tracing::info!("Started {} ({})", id, self.describe(range));
        Ok(BatchHandle {
            id,
            cancel,
            status,
            thread: Some(thread),
        })
    }

    /// Cancel a background run.
    pub fn cancel(&self, handle: &BatchHandle) {
        handle.cancel();
    }

    /// Current status of a background run.
    pub fn poll(&self, handle: &BatchHandle) -> BatchStatus {
        handle.poll()
    }

    fn describe(&self, range: FrameRange) -> String {
        match range {
            FrameRange::All => "all frames".to_string(),
            FrameRange::Span { first, last } => format!("{}..={}", first, last),
        }
    }
}

fn run_batch(
    buffer: &FrameBuffer,
    engine: ReductionEngine,
    map_shards: usize,
    recipe: &ReductionRecipe,
    range: FrameRange,
    cancel: &CancelToken,
    mut progress: impl FnMut(usize, usize),
) -> BatchResult {
    let map = ScanMap::with_shards(map_shards);
    let mut skipped = Vec::new();
    let mut failed = Vec::new();
    let mut processed = 0;
    let mut complete = true;

    let span = range.resolve(buffer.high_water_mark());
    let retained = span
        .clone()
        .map(|s| buffer.retained_ids(s))
        .unwrap_or_default();

    if let Some(span) = span {
        let mut kept = retained.iter().peekable();
        let mut id = *span.start();
        while id <= *span.end() {
            if kept.peek() == Some(&&id) {
                kept.next();
            } else {
                skipped.push(SkippedFrame {
                    sequence_id: id,
                    reason: SkipReason::EvictedBeforeRun,
                });
            }
            id = id.next();
        }
    }

    let total = retained.len();
    for (done, &sequence_id) in retained.iter().enumerate() {
        if cancel.is_cancelled() {
            complete = false;
            tracing::info!("Batch cancelled after {} of {} frames", done, total);
            break;
        }
        progress(done, total);

        let Some(pinned) = buffer.pin(sequence_id) else {
            skipped.push(SkippedFrame {
                sequence_id,
                reason: SkipReason::EvictedDuringRun,
            });
            continue;
        };
        let frame = pinned.frame();
        let reduced = engine.reduce(&frame, recipe);
        drop(pinned);

        match reduced {
            Ok(value) => {
                // Ids ascend, so a stale rejection cannot happen on a fresh map.
                if let Err(e) = map.update(frame.position(), sequence_id, value) {
                    tracing::debug!("Batch update skipped: {}", e);
                } else {
                    processed += 1;
                }
            }
            Err(error) => {
                map.mark_unfilled(frame.position(), sequence_id);
                failed.push(FailedFrame {
                    sequence_id,
                    position: frame.position(),
                    error,
                });
            }
        }
    }
    if complete {
        progress(total, total);
    }

    skipped.sort_by_key(|s| s.sequence_id);
    let mut snapshot = map.snapshot();
    snapshot.complete = complete;

    tracing::info!(
        "Batch {}: {} reduced, {} skipped, {} failed{}",
        recipe.operation_name(),
        processed,
        skipped.len(),
        failed.len(),
        if complete { "" } else { " (incomplete)" }
    );

    BatchResult {
        recipe: recipe.clone(),
        snapshot,
        processed,
        skipped,
        failed,
    }
}

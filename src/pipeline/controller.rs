//! Live controller: admission, reduction workers and the live scan map.
//!
//! Frames pushed by acquisition are admitted to the [`FrameBuffer`] on the
//! caller's thread (cheap, never waits on reduction) and handed to a pool of
//! reduction workers over a crossbeam channel. Workers reduce, fold the result
//! into the [`ScanMap`] and publish a [`MapNotification`].
//!
//! # State machine
//!
//! ```text
//! Idle ──start──► Running ◄──resume── Paused
//!                   │ └─────pause──────►┘
//!                   └──stop──► Stopped (terminal, reachable from any state)
//! ```
//!
//! In `Idle` and `Paused` frames are still admitted but their reduction is
//! deferred. Entering `Running` dispatches deferred work in sequence-id order.
//!
//! # Recipes
//!
//! The recipe in force is captured when a frame is admitted, so `set_recipe`
//! only affects frames admitted afterwards.

use crate::config::AppConfig;
use crate::pipeline::bridge::{MapNotification, MapNotifier};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::frame_buffer::FrameBuffer;
use crate::pipeline::id::{Generation, SequenceId};
use crate::pipeline::reduction::{ReductionEngine, ReductionRecipe};
use crate::pipeline::scan_map::{MapSnapshot, ScanMap};
use crate::types::{Coordinate, FrameData, FrameStatus, FrameSubmission};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Lifecycle state of the live controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl ControllerState {
    pub fn name(&self) -> &'static str {
        match self {
            ControllerState::Idle => "Idle",
            ControllerState::Running => "Running",
            ControllerState::Paused => "Paused",
            ControllerState::Stopped => "Stopped",
        }
    }
}

/// Counters for a status indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStats {
    /// Frames accepted by `submit`
    pub submitted: u64,
    /// Submissions refused (stopped controller or full buffer)
    pub rejected: u64,
    /// Successful reductions
    pub reduced: u64,
    /// Frames whose reduction failed
    pub discarded: u64,
    /// Results dropped because a newer frame already filled the coordinate
    pub stale_rejected: u64,
    /// Frames evicted from the buffer before a worker reached them
    pub evicted_before_reduction: u64,
    /// Frames waiting for `Running`
    pub deferred: usize,
    /// Frames dispatched to workers and not finished yet
    pub in_flight: usize,
    pub buffered: usize,
    pub generation: Generation,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    reduced: AtomicU64,
    discarded: AtomicU64,
    stale_rejected: AtomicU64,
    evicted_before_reduction: AtomicU64,
}

/// One unit of reduction work.
struct Job {
    sequence_id: SequenceId,
    recipe: Arc<ReductionRecipe>,
}

/// State shared with the worker threads.
struct Shared {
    buffer: Arc<FrameBuffer>,
    map: Arc<ScanMap>,
    engine: ReductionEngine,
    notifier: MapNotifier,
    counters: Counters,
    in_flight: AtomicUsize,
}

impl Shared {
    fn process(&self, job: Job) {
        let sequence_id = job.sequence_id;
        let Some(pinned) = self.buffer.pin(sequence_id) else {
            self.counters
                .evicted_before_reduction
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!("{} evicted before reduction", sequence_id);
            return;
        };
        let frame = pinned.frame();
        let position = frame.position();

        match self.engine.reduce(&frame, &job.recipe) {
            Ok(value) => {
                self.counters.reduced.fetch_add(1, Ordering::Relaxed);
                self.mark(sequence_id, FrameStatus::Reduced);
                match self.map.update(position, sequence_id, value) {
                    Ok(generation) => {
                        tracing::trace!("{} -> {} = {}", sequence_id, position, value.scalar());
                        self.notifier.publish(MapNotification::Updated(generation));
                    }
                    Err(PipelineError::StaleUpdateRejected { stored, .. }) => {
                        self.counters.stale_rejected.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            "Dropped {} at {}: {} already stored",
                            sequence_id,
                            position,
                            stored
                        );
                    }
                    Err(e) => tracing::error!("Map update for {} failed: {}", sequence_id, e),
                }
            }
            Err(err) => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                self.mark(sequence_id, FrameStatus::Discarded);
                if let Some(generation) = self.map.mark_unfilled(position, sequence_id) {
                    self.notifier.publish(MapNotification::Updated(generation));
                }
                tracing::warn!(
                    "Discarded {} at {} ({} recipe): {}",
                    sequence_id,
                    position,
                    job.recipe.operation_name(),
                    err
                );
            }
        }
    }

    /// The caller holds a pin, so the frame is still buffered.
    fn mark(&self, sequence_id: SequenceId, status: FrameStatus) {
        if let Err(e) = self.buffer.set_status(sequence_id, status) {
            tracing::debug!("Could not mark {} {:?}: {}", sequence_id, status, e);
        }
    }
}

fn worker_loop(shared: Arc<Shared>, jobs: Receiver<Job>) {
    for job in jobs.iter() {
        shared.process(job);
        shared.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Control {
    state: ControllerState,
    recipe: Arc<ReductionRecipe>,
    deferred: VecDeque<Job>,
    job_tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

/// Orchestrates live ingestion into a scan map.
pub struct LiveController {
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl LiveController {
    /// Build a controller from configuration and spawn its reduction workers.
    /// The controller starts in `Idle`.
    pub fn new(config: &AppConfig) -> PipelineResult<Self> {
        let mut buffer = FrameBuffer::new(config.buffer.capacity);
        if let Some(max_age) = config.buffer.max_age() {
            buffer = buffer.with_max_age(max_age);
        }
        let engine =
            ReductionEngine::new().with_skip_non_finite(config.reduction.skip_non_finite);

        let shared = Arc::new(Shared {
            buffer: Arc::new(buffer),
            map: Arc::new(ScanMap::with_shards(config.controller.map_shards)),
            engine,
            notifier: MapNotifier::new(config.controller.notify_capacity),
            counters: Counters::default(),
            in_flight: AtomicUsize::new(0),
        });

        let (job_tx, job_rx) = unbounded::<Job>();
        let worker_count = config.controller.worker_threads.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let shared = Arc::clone(&shared);
            let jobs = job_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("beamview-reduce-{}", i))
                .spawn(move || worker_loop(shared, jobs))?;
            workers.push(handle);
        }

        tracing::info!(
            "Live controller ready: {} workers, buffer capacity {}, recipe {}",
            worker_count,
            shared.buffer.capacity(),
            config.reduction.recipe.operation_name()
        );

        Ok(Self {
            shared,
            control: Mutex::new(Control {
                state: ControllerState::Idle,
                recipe: Arc::new(config.reduction.recipe.clone()),
                deferred: VecDeque::new(),
                job_tx: Some(job_tx),
                workers,
            }),
        })
    }

    fn lock_control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(&self, control: &Control, job: Job) {
        let Some(tx) = control.job_tx.as_ref() else {
            return;
        };
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        if tx.send(job).is_err() {
            self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            tracing::error!("Reduction workers are gone; job dropped");
        }
    }

    /// Accept a frame from acquisition. Returns its sequence id, or the reason
    /// it was refused. Never waits for reduction.
    pub fn submit_frame(
        &self,
        raw_data: FrameData,
        position: Coordinate,
        timestamp: Duration,
    ) -> PipelineResult<SequenceId> {
        self.submit(FrameSubmission::new(raw_data, position, timestamp))
    }

    /// Like [`submit_frame`](Self::submit_frame) for a fully described frame.
    pub fn submit(&self, submission: FrameSubmission) -> PipelineResult<SequenceId> {
        let mut control = self.lock_control();
        if control.state == ControllerState::Stopped {
            self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PipelineError::ControllerStopped);
        }

        let sequence_id = match self.shared.buffer.admit(submission) {
            Ok(id) => id,
            Err(e) => {
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Frame rejected: {}", e);
                return Err(e);
            }
        };
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let job = Job {
            sequence_id,
            recipe: Arc::clone(&control.recipe),
        };
        if control.state == ControllerState::Running {
            self.dispatch(&control, job);
        } else {
            control.deferred.push_back(job);
        }
        Ok(sequence_id)
    }

    /// Re-reduce a retained frame with the current recipe.
    ///
    /// The frame keeps its sequence id, so its new value replaces the old one
    /// unless a newer frame has filled the coordinate since.
    pub fn reprocess(&self, sequence_id: SequenceId) -> PipelineResult<()> {
        let mut control = self.lock_control();
        if control.state == ControllerState::Stopped {
            return Err(PipelineError::ControllerStopped);
        }
        self.shared
            .buffer
            .set_status(sequence_id, FrameStatus::Raw)?;
        let job = Job {
            sequence_id,
            recipe: Arc::clone(&control.recipe),
        };
        if control.state == ControllerState::Running {
            self.dispatch(&control, job);
        } else {
            control.deferred.push_back(job);
        }
        tracing::debug!("Reprocessing {}", sequence_id);
        Ok(())
    }

    /// `Idle → Running`.
    pub fn start(&self) -> PipelineResult<()> {
        self.enter_running(ControllerState::Idle, "start")
    }

    /// `Paused → Running`. Deferred frames are reduced in sequence-id order.
    pub fn resume(&self) -> PipelineResult<()> {
        self.enter_running(ControllerState::Paused, "resume")
    }

    fn enter_running(&self, from: ControllerState, action: &'static str) -> PipelineResult<()> {
        let mut control = self.lock_control();
        if control.state != from {
            return Err(PipelineError::InvalidTransition {
                from: control.state.name(),
                action,
            });
        }
        control.state = ControllerState::Running;

        let mut jobs: Vec<Job> = control.deferred.drain(..).collect();
        // Reprocess requests can be queued behind newer frames.
        jobs.sort_by_key(|job| job.sequence_id);
        let count = jobs.len();
        for job in jobs {
            self.dispatch(&control, job);
        }
        tracing::info!("Controller running ({} deferred frames dispatched)", count);
        Ok(())
    }

    /// `Running → Paused`. Admission continues; reduction waits.
    pub fn pause(&self) -> PipelineResult<()> {
        let mut control = self.lock_control();
        if control.state != ControllerState::Running {
            return Err(PipelineError::InvalidTransition {
                from: control.state.name(),
                action: "pause",
            });
        }
        control.state = ControllerState::Paused;
        tracing::info!("Controller paused");
        Ok(())
    }

    /// Enter the terminal `Stopped` state.
    ///
    /// Work already dispatched finishes; deferred frames stay buffered but are
    /// not reduced. Blocks until the workers exit. Calling it again is a no-op.
    pub fn stop(&self) -> PipelineResult<()> {
        let workers = {
            let mut control = self.lock_control();
            if control.state == ControllerState::Stopped {
                return Ok(());
            }
            control.state = ControllerState::Stopped;
            let abandoned = control.deferred.len();
            control.deferred.clear();
            if abandoned > 0 {
                tracing::info!("{} deferred frames left unreduced at stop", abandoned);
            }
            // Closing the channel lets workers drain what is queued and exit.
            control.job_tx = None;
            std::mem::take(&mut control.workers)
        };

        for worker in workers {
            if worker.join().is_err() {
                tracing::error!("Reduction worker panicked");
            }
        }
        self.shared.notifier.close();
        tracing::info!("Controller stopped");
        Ok(())
    }

    /// Change the recipe for frames admitted from now on.
    pub fn set_recipe(&self, recipe: ReductionRecipe) {
        tracing::info!("Live recipe set to {}", recipe.operation_name());
        self.lock_control().recipe = Arc::new(recipe);
    }

    pub fn recipe(&self) -> Arc<ReductionRecipe> {
        Arc::clone(&self.lock_control().recipe)
    }

    pub fn state(&self) -> ControllerState {
        self.lock_control().state
    }

    /// Snapshot of the live map.
    pub fn get_latest_map(&self) -> MapSnapshot {
        self.shared.map.snapshot()
    }

    /// Subscribe to generation-change notifications.
    pub fn subscribe(&self) -> Receiver<MapNotification> {
        self.shared.notifier.subscribe()
    }

    /// Clear the live map. Buffered frames are kept.
    pub fn reset_map(&self) -> Generation {
        let generation = self.shared.map.reset();
        self.shared
            .notifier
            .publish(MapNotification::Reset(generation));
        generation
    }

    /// Read access to the live map.
    pub fn map(&self) -> &ScanMap {
        &self.shared.map
    }

    /// The frame buffer, for a post-processor or frame viewer.
    pub fn buffer(&self) -> Arc<FrameBuffer> {
        Arc::clone(&self.shared.buffer)
    }

    pub fn stats(&self) -> ControllerStats {
        let deferred = self.lock_control().deferred.len();
        let c = &self.shared.counters;
        ControllerStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            reduced: c.reduced.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            stale_rejected: c.stale_rejected.load(Ordering::Relaxed),
            evicted_before_reduction: c.evicted_before_reduction.load(Ordering::Relaxed),
            deferred,
            in_flight: self.shared.in_flight.load(Ordering::Acquire),
            buffered: self.shared.buffer.len(),
            generation: self.shared.map.generation(),
        }
    }

    /// Block until no dispatched work remains or `timeout` passes. Returns
    /// whether the workers went idle. Deferred frames do not count.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.in_flight.load(Ordering::Acquire) == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for LiveController {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl std::fmt::Debug for LiveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveController")
            .field("state", &self.state())
            .field("buffer", &self.shared.buffer)
            .field("map", &self.shared.map)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::reduction::{Region, Roi};

    const WAIT: Duration = Duration::from_secs(5);

    fn controller(workers: usize) -> LiveController {
        let mut config = AppConfig::default();
        config.controller.worker_threads = workers;
        LiveController::new(&config).unwrap()
    }

    fn ones() -> FrameData {
        FrameData::filled(4, 4, 1.0).unwrap()
    }

    #[test]
    fn test_starts_idle_and_defers() {
        let c = controller(1);
        assert_eq!(c.state(), ControllerState::Idle);
        c.submit_frame(ones(), Coordinate::new(0, 0), Duration::ZERO)
            .unwrap();
        assert_eq!(c.stats().deferred, 1);
        assert!(c.get_latest_map().is_empty());

        c.start().unwrap();
        assert!(c.wait_idle(WAIT));
        assert_eq!(c.get_latest_map().value_at(Coordinate::new(0, 0)), Some(16.0));
    }

    #[test]
    fn test_invalid_transitions() {
        let c = controller(1);
        assert!(matches!(
            c.pause(),
            Err(PipelineError::InvalidTransition { from: "Idle", .. })
        ));
        assert!(c.resume().is_err());
        c.start().unwrap();
        assert!(c.start().is_err());
        c.pause().unwrap();
        c.resume().unwrap();
        c.stop().unwrap();
        assert!(c.start().is_err());
        assert!(c.stop().is_ok());
    }

    #[test]
    fn test_stopped_rejects_submissions() {
        let c = controller(1);
        c.start().unwrap();
        c.stop().unwrap();
        let err = c
            .submit_frame(ones(), Coordinate::new(0, 0), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, PipelineError::ControllerStopped));
        assert_eq!(c.stats().rejected, 1);
        assert!(matches!(
            c.reprocess(SequenceId(1)),
            Err(PipelineError::ControllerStopped)
        ));
    }

    #[test]
    fn test_bad_frame_is_isolated() {
        let c = controller(1);
        c.set_recipe(ReductionRecipe::sum(Roi::Region(
            Region::new(0, 0, 3, 3).unwrap(),
        )));
        c.start().unwrap();

        let small = FrameData::filled(2, 2, 1.0).unwrap();
        let bad = c
            .submit_frame(small, Coordinate::new(0, 0), Duration::ZERO)
            .unwrap();
        c.submit_frame(ones(), Coordinate::new(0, 1), Duration::from_millis(1))
            .unwrap();
        assert!(c.wait_idle(WAIT));

        let snap = c.get_latest_map();
        assert_eq!(snap.value_at(Coordinate::new(0, 1)), Some(9.0));
        assert!(!snap.get(Coordinate::new(0, 0)).unwrap().is_filled());
        assert_eq!(c.buffer().get(bad).unwrap().status, FrameStatus::Discarded);
        assert_eq!(c.stats().discarded, 1);
        assert_eq!(c.stats().reduced, 1);
    }

    #[test]
    fn test_recipe_change_applies_to_later_frames() {
        let c = controller(1);
        // Admitted under Sum while idle...
        c.submit_frame(ones(), Coordinate::new(0, 0), Duration::ZERO)
            .unwrap();
        c.set_recipe(ReductionRecipe::mean(Roi::Full));
        c.submit_frame(ones(), Coordinate::new(0, 1), Duration::ZERO)
            .unwrap();
        c.start().unwrap();
        assert!(c.wait_idle(WAIT));

        let snap = c.get_latest_map();
        assert_eq!(snap.value_at(Coordinate::new(0, 0)), Some(16.0));
        assert_eq!(snap.value_at(Coordinate::new(0, 1)), Some(1.0));
    }

    #[test]
    fn test_reprocess_replaces_value_and_revives_discarded() {
        let c = controller(1);
        c.set_recipe(ReductionRecipe::sum(Roi::Region(
            Region::new(0, 0, 8, 8).unwrap(),
        )));
        c.start().unwrap();
        let id = c
            .submit_frame(ones(), Coordinate::new(3, 3), Duration::ZERO)
            .unwrap();
        assert!(c.wait_idle(WAIT));
        assert_eq!(c.buffer().get(id).unwrap().status, FrameStatus::Discarded);

        c.set_recipe(ReductionRecipe::max(Roi::Full));
        c.reprocess(id).unwrap();
        assert!(c.wait_idle(WAIT));
        assert_eq!(c.get_latest_map().value_at(Coordinate::new(3, 3)), Some(1.0));
        assert_eq!(c.buffer().get(id).unwrap().status, FrameStatus::Reduced);
    }

    #[test]
    fn test_notifications_follow_updates() {
        let c = controller(1);
        let rx = c.subscribe();
        c.start().unwrap();
        c.submit_frame(ones(), Coordinate::new(0, 0), Duration::ZERO)
            .unwrap();
        let n = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(n, MapNotification::Updated(Generation(1)));

        let g = c.reset_map();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), MapNotification::Reset(g));
        c.stop().unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), MapNotification::Stopped);
    }

    #[test]
    fn test_discarded_frame_notifies_subscribers() {
        let c = controller(1);
        c.set_recipe(ReductionRecipe::sum(Roi::Region(
            Region::new(0, 0, 8, 8).unwrap(),
        )));
        let rx = c.subscribe();
        c.start().unwrap();
        c.submit_frame(ones(), Coordinate::new(0, 0), Duration::ZERO)
            .unwrap();

        let n = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(n, MapNotification::Updated(Generation(1)));
        let snap = c.get_latest_map();
        assert_eq!(snap.generation, Generation(1));
        assert_eq!(snap.unfilled().collect::<Vec<_>>(), vec![Coordinate::new(0, 0)]);

        // A second failure at the same coordinate writes nothing, so no notice.
        c.submit_frame(ones(), Coordinate::new(0, 0), Duration::ZERO)
            .unwrap();
        assert!(c.wait_idle(WAIT));
        assert!(rx.try_recv().is_err());
        assert_eq!(c.map().generation(), Generation(1));
    }
}

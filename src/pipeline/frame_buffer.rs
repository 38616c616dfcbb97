//! Bounded store of admitted frames, indexed by sequence id.
//!
//! The index is a `BTreeMap` behind an `RwLock` that is only held for map
//! operations (insert, remove, lookup). Pixel data lives in an `Arc` so readers
//! clone a handle instead of copying the image. Each slot carries its own status
//! lock and an atomic pin count, so status changes and pinning never take the
//! index write lock.
//!
//! Sequence ids are allocated while the write lock is held, which makes them
//! unique and strictly increasing in admission order even under concurrent
//! `admit` calls.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::SequenceId;
use crate::types::{Frame, FrameData, FrameMetadata, FrameStatus, FrameSubmission};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

/// Explicit eviction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Keep at most this many frames (oldest go first)
    Capacity(usize),
    /// Drop frames admitted longer ago than this
    MaxAge(Duration),
    /// Drop every frame with a sequence id below this one
    Before(SequenceId),
}

struct FrameSlot {
    meta: FrameMetadata,
    data: Arc<FrameData>,
    status: Mutex<FrameStatus>,
    pins: AtomicUsize,
    admitted_at: Instant,
}

impl FrameSlot {
    fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    fn status(&self) -> FrameStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn to_frame(&self) -> Frame {
        Frame {
            meta: self.meta,
            data: Arc::clone(&self.data),
            status: self.status(),
        }
    }
}

struct Index {
    frames: BTreeMap<SequenceId, Arc<FrameSlot>>,
    next_id: u64,
}

/// RAII guard that keeps a frame from being evicted while it is read.
pub struct PinnedFrame {
    slot: Arc<FrameSlot>,
}

impl PinnedFrame {
    /// Snapshot of the pinned frame (status read now).
    pub fn frame(&self) -> Frame {
        self.slot.to_frame()
    }

    pub fn sequence_id(&self) -> SequenceId {
        self.slot.meta.sequence_id
    }
}

impl Drop for PinnedFrame {
    fn drop(&mut self) {
        self.slot.pins.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for PinnedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedFrame")
            .field("sequence_id", &self.slot.meta.sequence_id)
            .finish()
    }
}

/// Bounded, concurrently accessible frame store.
pub struct FrameBuffer {
    index: RwLock<Index>,
    capacity: usize,
    max_age: Option<Duration>,
    /// Last id handed out; 0 before the first admission.
    high_water: AtomicU64,
}

impl FrameBuffer {
    /// Create a buffer holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            index: RwLock::new(Index {
                frames: BTreeMap::new(),
                next_id: SequenceId::FIRST.get(),
            }),
            capacity: capacity.max(1),
            max_age: None,
            high_water: AtomicU64::new(0),
        }
    }

    /// Also drop frames older than `max_age` whenever a new frame is admitted.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    fn read_index(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a frame and assign its sequence id.
    ///
    /// Evicts the oldest unpinned frame when full. Fails only if the buffer is
    /// full and every retained frame is pinned.
    pub fn admit(&self, submission: FrameSubmission) -> PipelineResult<SequenceId> {
        let FrameSubmission {
            data,
            position,
            timestamp,
            monitor,
        } = submission;
        let data = Arc::new(data);
        let now = Instant::now();

        let mut index = self.write_index();

        if let Some(max_age) = self.max_age {
            let expired = Self::remove_where(&mut index.frames, |slot| {
                now.saturating_duration_since(slot.admitted_at) > max_age
            });
            if !expired.is_empty() {
                tracing::trace!("Aged out {} frames on admission", expired.len());
            }
        }

        if index.frames.len() >= self.capacity {
            let victim = index
                .frames
                .iter()
                .find(|(_, slot)| !slot.is_pinned())
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    index.frames.remove(&id);
                    tracing::trace!("Evicted {} to make room", id);
                }
                None => {
                    return Err(PipelineError::Admission(format!(
                        "buffer full ({} frames) and every frame is pinned",
                        self.capacity
                    )));
                }
            }
        }

        let sequence_id = SequenceId(index.next_id);
        index.next_id += 1;
        index.frames.insert(
            sequence_id,
            Arc::new(FrameSlot {
                meta: FrameMetadata {
                    sequence_id,
                    position,
                    timestamp,
                    monitor,
                },
                data,
                status: Mutex::new(FrameStatus::Raw),
                pins: AtomicUsize::new(0),
                admitted_at: now,
            }),
        );
        self.high_water.store(sequence_id.get(), Ordering::Release);

        Ok(sequence_id)
    }

    /// Look up a retained frame.
    pub fn get(&self, id: SequenceId) -> PipelineResult<Frame> {
        self.read_index()
            .frames
            .get(&id)
            .map(|slot| slot.to_frame())
            .ok_or(PipelineError::NotFound(id))
    }

    pub fn contains(&self, id: SequenceId) -> bool {
        self.read_index().frames.contains_key(&id)
    }

    /// Pin a retained frame so eviction skips it until the guard is dropped.
    pub fn pin(&self, id: SequenceId) -> Option<PinnedFrame> {
        let index = self.read_index();
        let slot = index.frames.get(&id)?;
        // Incremented under the read lock: eviction needs the write lock, so it
        // cannot interleave between the lookup and the increment.
        slot.pins.fetch_add(1, Ordering::AcqRel);
        Some(PinnedFrame {
            slot: Arc::clone(slot),
        })
    }

    /// Change the status of a retained frame.
    pub fn set_status(&self, id: SequenceId, status: FrameStatus) -> PipelineResult<()> {
        let slot = self
            .read_index()
            .frames
            .get(&id)
            .cloned()
            .ok_or(PipelineError::NotFound(id))?;
        *slot.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
        Ok(())
    }

    /// Apply an eviction policy. Pinned frames are never evicted. Returns the
    /// evicted ids in ascending order.
    pub fn evict(&self, policy: EvictionPolicy) -> Vec<SequenceId> {
        let mut index = self.write_index();
        let evicted = match policy {
            EvictionPolicy::Capacity(keep) => {
                let excess = index.frames.len().saturating_sub(keep);
                let victims: Vec<SequenceId> = index
                    .frames
                    .iter()
                    .filter(|(_, slot)| !slot.is_pinned())
                    .map(|(id, _)| *id)
                    .take(excess)
                    .collect();
                for id in &victims {
                    index.frames.remove(id);
                }
                victims
            }
            EvictionPolicy::MaxAge(max_age) => {
                let now = Instant::now();
                Self::remove_where(&mut index.frames, |slot| {
                    now.saturating_duration_since(slot.admitted_at) > max_age
                })
            }
            EvictionPolicy::Before(limit) => {
                Self::remove_where(&mut index.frames, |slot| slot.meta.sequence_id < limit)
            }
        };
        if !evicted.is_empty() {
            tracing::debug!("Evicted {} frames ({:?})", evicted.len(), policy);
        }
        evicted
    }

    fn remove_where(
        frames: &mut BTreeMap<SequenceId, Arc<FrameSlot>>,
        mut pred: impl FnMut(&FrameSlot) -> bool,
    ) -> Vec<SequenceId> {
        let victims: Vec<SequenceId> = frames
            .iter()
            .filter(|(_, slot)| !slot.is_pinned() && pred(slot))
            .map(|(id, _)| *id)
            .collect();
        for id in &victims {
            frames.remove(id);
        }
        victims
    }

    /// Highest sequence id ever assigned, or `None` before the first admission.
    pub fn high_water_mark(&self) -> Option<SequenceId> {
        match self.high_water.load(Ordering::Acquire) {
            0 => None,
            id => Some(SequenceId(id)),
        }
    }

    pub fn len(&self) -> usize {
        self.read_index().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Ids currently retained within `range`, ascending.
    pub fn retained_ids(&self, range: RangeInclusive<SequenceId>) -> Vec<SequenceId> {
        self.read_index()
            .frames
            .range(range)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Lazily iterate over every frame retained now or admitted before the
    /// iterator reaches the current high-water mark.
    pub fn iter(&self) -> FrameIter<'_> {
        let end = self.high_water_mark().unwrap_or(SequenceId(0));
        FrameIter::new(self, SequenceId::FIRST, end)
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("high_water", &self.high_water_mark())
            .finish()
    }
}

/// Lazy, finite iterator over buffered frames.
///
/// Each step takes the index read lock just long enough to find the next
/// retained id, so frames evicted mid-iteration are simply not yielded.
#[derive(Clone)]
pub struct FrameIter<'a> {
    buffer: &'a FrameBuffer,
    start: SequenceId,
    cursor: SequenceId,
    end: SequenceId,
}

impl<'a> FrameIter<'a> {
    fn new(buffer: &'a FrameBuffer, start: SequenceId, end: SequenceId) -> Self {
        Self {
            buffer,
            start,
            cursor: start,
            end,
        }
    }

    /// Rewind to the first id of the range.
    pub fn restart(&mut self) {
        self.cursor = self.start;
    }
}

impl Iterator for FrameIter<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.cursor > self.end {
            return None;
        }
        let buffer = self.buffer;
        let index = buffer.read_index();
        let (id, slot) = index.frames.range(self.cursor..=self.end).next()?;
        self.cursor = id.next();
        Some(slot.to_frame())
    }
}

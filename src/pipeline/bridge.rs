//! Thread boundary between the pipeline and its UI consumers.
//!
//! Consumers subscribe for [`MapNotification`]s over a bounded crossbeam
//! channel. Notifications are informational: they say "the map is at least at
//! generation N", and the consumer pulls a fresh snapshot. Nothing mutable ever
//! crosses the channel.
//!
//! When a subscriber's channel is full the notification is dropped for that
//! subscriber: it already has an undelivered notice telling it to re-fetch, and
//! the snapshot it fetches will be at least as new as the one dropped.

use crate::pipeline::id::Generation;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Default per-subscriber channel capacity.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 64;

/// Messages sent from the pipeline to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapNotification {
    /// The live map reached at least this generation.
    Updated(Generation),
    /// The live map was cleared.
    Reset(Generation),
    /// The controller stopped; no further notifications follow.
    Stopped,
}

impl MapNotification {
    pub fn generation(&self) -> Option<Generation> {
        match self {
            MapNotification::Updated(g) | MapNotification::Reset(g) => Some(*g),
            MapNotification::Stopped => None,
        }
    }
}

/// Fan-out of map notifications to any number of subscribers.
pub struct MapNotifier {
    subscribers: Mutex<Vec<Sender<MapNotification>>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl MapNotifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a new subscriber. Dropping the receiver unsubscribes.
    ///
    /// After [`close`](Self::close) the returned receiver is already
    /// disconnected.
    pub fn subscribe(&self) -> Receiver<MapNotification> {
        let (tx, rx) = bounded(self.capacity);
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Checked under the lock so a concurrent close cannot miss this sender
        if !self.closed.load(Ordering::Acquire) {
            subscribers.push(tx);
        }
        rx
    }

    /// Deliver to every live subscriber without blocking.
    pub fn publish(&self, notification: MapNotification) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.deliver(&mut subscribers, notification);
    }

    /// Send [`MapNotification::Stopped`] and disconnect every subscriber.
    ///
    /// A subscriber whose queue is full misses the `Stopped` message but still
    /// sees the channel close.
    pub fn close(&self) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.deliver(&mut subscribers, MapNotification::Stopped);
        self.closed.store(true, Ordering::Release);
        subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn deliver(
        &self,
        subscribers: &mut Vec<Sender<MapNotification>>,
        notification: MapNotification,
    ) {
        subscribers.retain(|tx| match tx.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Notifications coalesced away because a subscriber was behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for MapNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_CAPACITY)
    }
}

impl Drop for MapNotifier {
    fn drop(&mut self) {
        let dropped = self.dropped();
        if dropped > 0 {
            tracing::warn!(
                "MapNotifier coalesced {} notifications due to backpressure",
                dropped
            );
        }
    }
}

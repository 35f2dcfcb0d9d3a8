//! Fan-out of committed mutations to every subscribed observer.
//!
//! Each observer owns a bounded tokio mpsc queue. `publish` pushes the same
//! `Arc<MutationEvent>` into every queue without awaiting, so the
//! publisher never suspends and every observer sees commits in publish
//! order.
//!
//! Backpressure policy: a full queue means the observer has fallen too far
//! behind. It is unsubscribed on the spot. Events already in its queue are
//! still delivered; after them the stream ends with
//! [`SyncError::ObserverOverflow`] so the observer knows to rejoin with a
//! fresh snapshot. Pending mutations are never dropped to make room.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use uuid::Uuid;

use crate::cell::MutationEvent;
use crate::error::SyncError;

/// Default per-observer queue length.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Statistics for monitoring bus health.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub events_published: u64,
    pub observers_dropped: u64,
    pub active_observers: usize,
}

/// Lock-free counters behind [`BusStats`].
struct AtomicBusStats {
    events_published: AtomicU64,
    observers_dropped: AtomicU64,
}

struct ObserverSlot {
    sender: mpsc::Sender<Arc<MutationEvent>>,
    overflowed: Arc<AtomicBool>,
}

/// One observer's view of the stream.
pub struct Subscription {
    observer_id: Uuid,
    initial_sequence: u64,
    receiver: mpsc::Receiver<Arc<MutationEvent>>,
    overflowed: Arc<AtomicBool>,
}

impl Subscription {
    pub fn observer_id(&self) -> Uuid {
        self.observer_id
    }

    /// Last sequence published before this subscription was registered.
    /// Every event delivered here has a greater sequence.
    pub fn initial_sequence(&self) -> u64 {
        self.initial_sequence
    }

    /// Wait for the next event.
    pub async fn recv(&mut self) -> Result<Arc<MutationEvent>, SyncError> {
        match self.receiver.recv().await {
            Some(event) => Ok(event),
            None => Err(self.closed_error()),
        }
    }

    /// Take the next event if one is queued.
    pub fn try_recv(&mut self) -> Result<Option<Arc<MutationEvent>>, SyncError> {
        match self.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.closed_error()),
        }
    }

    /// Whether the bus dropped this observer for falling behind.
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    fn closed_error(&self) -> SyncError {
        if self.overflowed() {
            SyncError::ObserverOverflow {
                observer: self.observer_id,
            }
        } else {
            SyncError::ObserverClosed {
                observer: self.observer_id,
            }
        }
    }
}

/// The event bus for one grid.
pub struct EventBus {
    observers: Mutex<HashMap<Uuid, ObserverSlot>>,
    /// Sequence of the most recent publish; guarded with `observers` so
    /// subscribe and publish agree on the join point.
    last_sequence: AtomicU64,
    capacity: usize,
    stats: AtomicBusStats,
}

impl EventBus {
    /// `capacity` is the number of events buffered per observer before
    /// that observer is disconnected.
    pub fn new(capacity: usize) -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            last_sequence: AtomicU64::new(0),
            capacity: capacity.max(1),
            stats: AtomicBusStats {
                events_published: AtomicU64::new(0),
                observers_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Register an observer. An existing subscription with the same id is
    /// replaced and its stream ends.
    pub fn subscribe(&self, observer_id: Uuid) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let overflowed = Arc::new(AtomicBool::new(false));

        let mut observers = self.observers.lock();
        let initial_sequence = self.last_sequence.load(Ordering::Acquire);
        observers.insert(
            observer_id,
            ObserverSlot {
                sender,
                overflowed: overflowed.clone(),
            },
        );

        Subscription {
            observer_id,
            initial_sequence,
            receiver,
            overflowed,
        }
    }

    /// Stop delivering to an observer. Already queued events stay readable.
    pub fn unsubscribe(&self, observer_id: &Uuid) -> bool {
        self.observers.lock().remove(observer_id).is_some()
    }

    /// Release the slot held by `subscription`, unless a newer
    /// subscription has taken over its id.
    ///
    /// Returns false when the id now belongs to someone else.
    pub fn release(&self, subscription: &Subscription) -> bool {
        let mut observers = self.observers.lock();
        match observers.get(&subscription.observer_id) {
            Some(slot) if Arc::ptr_eq(&slot.overflowed, &subscription.overflowed) => {
                observers.remove(&subscription.observer_id);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Deliver `event` to every observer. Returns how many received it.
    ///
    /// Never blocks on a slow observer: a full queue disconnects it.
    pub fn publish(&self, event: MutationEvent) -> usize {
        let event = Arc::new(event);
        let mut observers = self.observers.lock();
        self.last_sequence.store(event.sequence, Ordering::Release);
        self.stats.events_published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        observers.retain(|observer_id, slot| match slot.sender.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                slot.overflowed.store(true, Ordering::Release);
                self.stats.observers_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Observer {observer_id} overflowed its {}-event queue at sequence {}, disconnecting",
                    self.capacity,
                    event.sequence
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::debug!("Observer {observer_id} went away, removing");
                false
            }
        });

        log::trace!("Published sequence {} to {delivered} observers", event.sequence);
        delivered
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn has_observer(&self, observer_id: &Uuid) -> bool {
        self.observers.lock().contains_key(observer_id)
    }

    /// Sequence of the most recently published event (0 if none).
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            observers_dropped: self.stats.observers_dropped.load(Ordering::Relaxed),
            active_observers: self.observer_count(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

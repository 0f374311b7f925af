//! Process-wide fan-out of scan events to live subscribers.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: a full queue
//! drops the event for that subscriber only, and a closed one is pruned.
//! There is no history; a new subscriber sees events from its subscribe
//! point onward.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::Stream;
use tracing::{debug, warn};

use crate::types::ScanEvent;

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct EventPublisher {
    inner: Arc<PublisherInner>,
}

#[derive(Debug)]
struct PublisherInner {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, SubscriberSlot>>,
}

#[derive(Debug)]
struct SubscriberSlot {
    tx: mpsc::Sender<ScanEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register a subscriber. Dropping the returned handle unregisters it.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        self.inner.slots().insert(
            id,
            SubscriberSlot {
                tx,
                dropped: dropped.clone(),
            },
        );
        debug!(subscriber = id, "event subscriber registered");
        Subscription {
            id,
            rx,
            dropped,
            publisher: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every current subscriber without blocking.
    pub fn publish(&self, event: ScanEvent) {
        let mut slots = self.inner.slots();
        slots.retain(|id, slot| match slot.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let n = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(subscriber = id, dropped = n, "subscriber queue full, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = id, "pruning closed subscriber");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.slots().len()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl PublisherInner {
    fn slots(&self) -> MutexGuard<'_, HashMap<u64, SubscriberSlot>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A live registration with the publisher, consumed as a `Stream` of events.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<ScanEvent>,
    dropped: Arc<AtomicU64>,
    publisher: std::sync::Weak<PublisherInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ScanEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<ScanEvent> {
        self.rx.try_recv().ok()
    }

    /// Number of events discarded for this subscriber because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Stream for Subscription {
    type Item = ScanEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.publisher.upgrade() {
            inner.slots().remove(&self.id);
            debug!(subscriber = self.id, "event subscriber released");
        }
    }
}

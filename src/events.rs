//! In-memory event bus.
//!
//! Device events ingested by the webhook endpoint are fanned out to every
//! live WebSocket session through a [`Bus`]. Each subscriber gets its own
//! bounded queue; a publisher never blocks — if a subscriber's queue is full
//! the event is dropped for that subscriber only. A slow client therefore
//! loses events rather than stalling ingestion or other clients.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

/// A device event delivered via webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub device: String,
    pub service: String,
    pub name: String,
    /// Raw event payload; treated as opaque JSON bytes.
    pub payload: Vec<u8>,
}

type SubscriberMap = HashMap<u64, mpsc::Sender<Event>>;

/// One-to-many pub/sub with drop-on-full semantics.
#[derive(Default)]
pub struct Bus {
    subs: Arc<RwLock<SubscriberMap>>,
    next_id: AtomicU64,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber with a queue of capacity `buffer`.
    ///
    /// The returned [`Subscription`] unsubscribes when dropped, which closes
    /// the channel; an explicit [`Subscription::cancel`] is equivalent and
    /// idempotent.
    pub fn subscribe(&self, buffer: usize) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(buffer);
        self.subs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        Subscription {
            id,
            rx,
            subs: Arc::clone(&self.subs),
        }
    }

    /// Deliver `event` to every current subscriber without blocking.
    ///
    /// Full queues drop the event for that subscriber; there is nothing to
    /// report back to the publisher.
    pub fn publish(&self, event: &Event) {
        let subs = self.subs.read().unwrap_or_else(|e| e.into_inner());
        for tx in subs.values() {
            let _ = tx.try_send(event.clone());
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subs.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Handle to a bus subscription; receives events and cancels on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    subs: Arc<RwLock<SubscriberMap>>,
}

impl Subscription {
    /// Subscriber id, unique per bus.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event. Returns `None` once cancelled and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Remove this subscription from the bus. The sender side is dropped,
    /// closing the channel; calling again is a no-op.
    pub fn cancel(&self) {
        self.subs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

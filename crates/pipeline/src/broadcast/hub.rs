//! Subscriber registry with bounded per-subscriber queues

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::message::OutboundMessage;

/// Broadcaster errors
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    /// The broadcaster has been shut down
    #[error("broadcaster is closed")]
    Closed,
}

/// One live subscription
///
/// Messages arrive in publish order. `recv` yields `None` once the subscriber
/// has been dropped for overflow or the broadcaster has closed.
pub struct Subscription {
    pub id: u64,
    receiver: mpsc::Receiver<Arc<OutboundMessage>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<OutboundMessage>> {
        self.receiver.recv().await
    }

    /// Non-blocking receive, `None` when nothing is queued
    pub fn try_recv(&mut self) -> Option<Arc<OutboundMessage>> {
        self.receiver.try_recv().ok()
    }
}

/// Fan-out of outbound messages to every live subscriber
///
/// Publishing never waits on a subscriber: each one has a bounded queue and a
/// subscriber whose queue is full is disconnected and removed. Registration,
/// removal and publishing are serialized by one internal lock.
pub struct Broadcaster {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<OutboundMessage>>>>,
    next_id: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
    dropped_subscribers: AtomicU64,
}

impl Broadcaster {
    /// Create a broadcaster whose subscribers each buffer up to `capacity` messages
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
            dropped_subscribers: AtomicU64::new(0),
        }
    }

    /// Register a subscriber; its queue already holds the `connected` message
    pub fn subscribe(&self) -> Result<Subscription, BroadcastError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::channel(self.capacity);

        let mut subscribers = self.subscribers.lock();
        if self.closed.load(Ordering::SeqCst) {
            return Err(BroadcastError::Closed);
        }
        // Cannot fail: the queue is new and has room for at least one message.
        let _ = tx.try_send(Arc::new(OutboundMessage::Connected { subscriber_id: id }));
        subscribers.insert(id, tx);

        debug!(subscriber_id = id, total = subscribers.len(), "Subscriber connected");
        Ok(Subscription { id, receiver })
    }

    /// Remove a subscriber; unknown ids are ignored
    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.lock().remove(&id).is_some() {
            debug!(subscriber_id = id, "Subscriber disconnected");
        }
    }

    /// Queue `message` for every subscriber, returning how many accepted it
    pub fn publish(&self, message: OutboundMessage) -> usize {
        let message = Arc::new(message);
        let mut delivered = 0;

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, tx| match tx.try_send(Arc::clone(&message)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    subscriber_id = *id,
                    kind = message.kind(),
                    "Subscriber queue full, disconnecting"
                );
                self.dropped_subscribers.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber_id = *id, "Subscriber went away");
                false
            }
        });

        delivered
    }

    /// Disconnect every subscriber and refuse new ones
    pub fn close_all(&self) {
        let mut subscribers = self.subscribers.lock();
        self.closed.store(true, Ordering::SeqCst);
        let count = subscribers.len();
        subscribers.clear();
        info!(count, "Closed all subscriber connections");
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Subscribers disconnected because their queue overflowed
    pub fn dropped_subscribers(&self) -> u64 {
        self.dropped_subscribers.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

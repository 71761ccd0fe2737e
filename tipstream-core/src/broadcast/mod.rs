//! Subscriber registry with best-effort fan-out.
//!
//! Each subscriber owns a bounded `tokio::sync::mpsc` queue. `publish` holds
//! the registry lock for the whole fan-out and only uses `try_send`, so it
//! never waits on a consumer: a full or closed queue gets the subscriber
//! dropped in the same call, and everyone else still receives the message.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};
use uuid::Uuid;

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

/// Opaque subscriber identity (the channel has no other identity).
pub type SubscriberId = Uuid;

/// Receiving half handed to a newly connected observer.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<Arc<str>>,
}

#[derive(Debug)]
pub struct BroadcastRegistry {
    channels: Mutex<HashMap<SubscriberId, mpsc::Sender<Arc<str>>>>,
    buffer: usize,
}

impl Default for BroadcastRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl BroadcastRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register a new outbound channel.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        let count = {
            let mut channels = self.channels.lock();
            channels.insert(id, tx);
            channels.len()
        };
        info!(subscriber = %id, subscribers = count, "subscriber connected");
        Subscription { id, receiver: rx }
    }

    /// Forget a channel. Unknown or already-removed ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.channels.lock().remove(&id).is_some();
        if removed {
            info!(subscriber = %id, "subscriber disconnected");
        }
        removed
    }

    /// Send `message` to every registered channel.
    ///
    /// Returns the number of subscribers it was delivered to.
    pub fn publish(&self, message: &str) -> usize {
        let message: Arc<str> = Arc::from(message);
        let mut channels = self.channels.lock();
        let mut delivered = 0usize;
        channels.retain(|id, tx| match tx.try_send(Arc::clone(&message)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                info!(subscriber = %id, "subscriber queue full, dropping slow subscriber");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = %id, "subscriber channel closed, removing");
                false
            }
        });
        delivered
    }

    /// Number of currently registered subscribers.
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    #[cfg(test)]
    fn contains(&self, id: SubscriberId) -> bool {
        self.channels.lock().contains_key(&id)
    }
}

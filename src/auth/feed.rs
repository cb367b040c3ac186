//! Session-change broadcast feed.
//!
//! Identity providers publish through a [`SessionFeed`]; consumers hold a
//! [`SessionSubscription`], which unsubscribes when dropped.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::types::{Session, SessionChange, SessionEventKind};

pub const DEFAULT_FEED_CAPACITY: usize = 64;

/// Provider-side publisher of [`SessionChange`] notifications.
#[derive(Debug)]
pub struct SessionFeed {
    sender: broadcast::Sender<SessionChange>,
    /// Last assigned sequence number. Held across `send` so channel order
    /// always matches `seq` order.
    seq: Mutex<u64>,
    subscribers: Arc<AtomicUsize>,
}

impl Default for SessionFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl SessionFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            seq: Mutex::new(0),
            subscribers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publish a change and return its sequence number.
    pub fn emit(&self, kind: SessionEventKind, session: Option<Session>) -> u64 {
        let mut seq = self.seq.lock();
        *seq += 1;
        let change = SessionChange {
            seq: *seq,
            kind,
            session,
        };
        // No receivers is fine; the seq is still consumed.
        let _ = self.sender.send(change);
        *seq
    }

    /// Sequence number of the most recent emitted change (0 if none).
    pub fn current_seq(&self) -> u64 {
        *self.seq.lock()
    }

    pub fn subscribe(&self) -> SessionSubscription {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
        SessionSubscription {
            receiver: self.sender.subscribe(),
            active: Some(self.subscribers.clone()),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }
}

/// Item yielded by [`SessionSubscription::next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Change(SessionChange),
    /// The subscriber fell behind and this many notifications were dropped.
    Lagged(u64),
}

/// Cancellable stream of session-change notifications.
#[derive(Debug)]
pub struct SessionSubscription {
    receiver: broadcast::Receiver<SessionChange>,
    active: Option<Arc<AtomicUsize>>,
}

impl SessionSubscription {
    /// Wait for the next notification. Returns `None` once the provider
    /// side has gone away.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        match self.receiver.recv().await {
            Ok(change) => Some(SubscriptionEvent::Change(change)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                Some(SubscriptionEvent::Lagged(skipped))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// End the subscription explicitly.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(counter) = self.active.take() {
            counter.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!("Session subscription released");
        }
    }
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

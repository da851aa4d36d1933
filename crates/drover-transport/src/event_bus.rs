use drover_core::Event;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Handle identifying one registered subscriber channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// In-process pub/sub bus for build events.
///
/// Every [`send`](EventBus::send) takes a snapshot of the subscriber set and
/// delivers to each channel from its own task, so a subscriber that stops
/// reading only stalls its own delivery. Subscribers whose receiver was
/// dropped are pruned on the next send. Delivery is best-effort and
/// at-most-once per subscriber; no ordering holds across subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscribers: Mutex<HashMap<SubscriptionId, mpsc::Sender<Arc<Event>>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a channel to receive all future events.
    pub async fn subscribe(&self, tx: mpsc::Sender<Arc<Event>>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.lock().await.insert(id, tx);
        debug!(subscriber = %id, "subscribed to event bus");
        id
    }

    /// Creates a bounded channel and registers its sending half.
    pub async fn subscribe_channel(
        &self,
        capacity: usize,
    ) -> (SubscriptionId, mpsc::Receiver<Arc<Event>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (self.subscribe(tx).await, rx)
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.inner.subscribers.lock().await.remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "unsubscribed from event bus");
        }
        removed
    }

    /// Publishes an event to all live subscribers.
    ///
    /// Returns the number of deliveries issued. Never blocks on a slow
    /// subscriber and never fails; must be called from within a tokio
    /// runtime.
    pub async fn send(&self, event: Event) -> usize {
        let event = Arc::new(event);

        let targets: Vec<(SubscriptionId, mpsc::Sender<Arc<Event>>)> = {
            let mut subscribers = self.inner.subscribers.lock().await;
            subscribers.retain(|id, tx| {
                let live = !tx.is_closed();
                if !live {
                    warn!(subscriber = %id, "pruning closed event subscriber");
                }
                live
            });
            subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        for (id, tx) in &targets {
            let id = *id;
            let tx = tx.clone();
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                if tx.send(event).await.is_err() {
                    warn!(subscriber = %id, "event dropped: subscriber closed during delivery");
                }
            });
        }

        targets.len()
    }

    /// Returns the number of registered subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().await.len()
    }
}

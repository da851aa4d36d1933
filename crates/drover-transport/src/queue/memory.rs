use async_trait::async_trait;
use drover_core::WorkItem;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::WorkQueue;
use crate::error::{Result, TransportError};

/// In-process FIFO work queue.
///
/// Pulls block until an item is published or the queue is closed. With a
/// lease configured, a claimed item that is neither acknowledged nor
/// extended in time goes back to the head of the queue and its old claim
/// is cancelled.
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    lease: Option<Duration>,
}

#[derive(Default)]
struct State {
    pending: VecDeque<WorkItem>,
    claimed: Vec<Claim>,
    next_claim: u64,
    closed: bool,
}

struct Claim {
    item: WorkItem,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Claim {
    fn holds(&self, item: &WorkItem) -> bool {
        self.item.id == item.id && self.item.claim == item.claim
    }
}

impl State {
    fn contains(&self, id: &str) -> bool {
        self.pending.iter().any(|i| i.id == id) || self.claimed.iter().any(|c| c.item.id == id)
    }

    fn claim_of(&self, item: &WorkItem) -> Result<usize> {
        self.claimed
            .iter()
            .position(|c| c.holds(item))
            .ok_or_else(|| TransportError::NotFound(item.id.clone()))
    }

    fn reap(&mut self, now: Instant) -> usize {
        let mut expired = Vec::new();
        self.claimed.retain_mut(|claim| match claim.deadline {
            Some(deadline) if deadline <= now => {
                claim.cancel.cancel();
                expired.push(claim.item.clone());
                false
            }
            _ => true,
        });

        let count = expired.len();
        for mut item in expired.into_iter().rev() {
            warn!(item = %item.id, claim = item.claim, "claim lease expired, requeueing");
            item.claim = 0;
            self.pending.push_front(item);
        }
        count
    }
}

impl MemoryQueue {
    /// Creates a queue whose claims never expire.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            lease: None,
        }
    }

    /// Creates a queue whose claims expire after `lease` unless extended.
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            lease: Some(lease),
            ..Self::new()
        }
    }

    /// Closes the queue and wakes every blocked pull with
    /// [`TransportError::Closed`].
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
        info!("work queue closed");
    }

    /// Returns the number of pending (unclaimed) items.
    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Returns true if nothing is pending.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns expired claims to the head of the queue.
    pub async fn reap_expired(&self) -> usize {
        let count = self.state.lock().await.reap(Instant::now());
        if count > 0 {
            self.notify.notify_one();
        }
        count
    }

    /// Spawns a task that reaps expired claims every `interval`.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if queue.state.lock().await.closed {
                    break;
                }
                queue.reap_expired().await;
            }
        })
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn publish(&self, mut item: WorkItem) -> Result<()> {
        item.validate()?;
        item.claim = 0;

        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(TransportError::Closed);
            }
            if state.contains(&item.id) {
                return Err(TransportError::Duplicate(item.id));
            }
            debug!(item = %item.id, "work item published");
            state.pending.push_back(item);
        }

        self.notify.notify_one();
        Ok(())
    }

    async fn remove(&self, item: &WorkItem) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.pending.len();
        state.pending.retain(|i| i.id != item.id);

        if state.pending.len() < before {
            debug!(item = %item.id, "pending work item removed");
        } else if let Some(claim) = state.claimed.iter().find(|c| c.item.id == item.id) {
            info!(item = %item.id, claim = claim.item.claim, "claimed work item cancelled");
            claim.cancel.cancel();
        }
        Ok(())
    }

    async fn pull(&self) -> Result<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(TransportError::Closed);
                }
                state.reap(Instant::now());

                if let Some(mut item) = state.pending.pop_front() {
                    state.next_claim += 1;
                    item.claim = state.next_claim;
                    let deadline = self.lease.map(|lease| Instant::now() + lease);
                    state.claimed.push(Claim {
                        item: item.clone(),
                        deadline,
                        cancel: CancellationToken::new(),
                    });
                    if !state.pending.is_empty() {
                        self.notify.notify_one();
                    }
                    debug!(item = %item.id, claim = item.claim, "work item claimed");
                    return Ok(item);
                }
            }

            notified.await;
        }
    }

    async fn ack(&self, item: &WorkItem) -> Result<()> {
        let mut state = self.state.lock().await;
        let idx = state.claim_of(item)?;
        state.claimed.remove(idx);
        debug!(item = %item.id, "work item acknowledged");
        Ok(())
    }

    async fn items(&self) -> Result<Vec<WorkItem>> {
        let state = self.state.lock().await;
        Ok(state
            .pending
            .iter()
            .cloned()
            .chain(state.claimed.iter().map(|c| c.item.clone()))
            .collect())
    }

    async fn extend(&self, item: &WorkItem) -> Result<()> {
        let mut state = self.state.lock().await;
        let idx = state.claim_of(item)?;
        state.claimed[idx].deadline = self.lease.map(|lease| Instant::now() + lease);
        Ok(())
    }

    async fn requeue(&self, item: &WorkItem) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(TransportError::Closed);
            }
            let idx = state.claim_of(item)?;
            let mut claim = state.claimed.remove(idx);
            claim.item.claim = 0;
            state.pending.push_front(claim.item);
        }
        debug!(item = %item.id, "work item requeued");
        self.notify.notify_one();
        Ok(())
    }

    async fn cancelled(&self, item: &WorkItem) -> Result<()> {
        let token = {
            let state = self.state.lock().await;
            let idx = state.claim_of(item)?;
            state.claimed[idx].cancel.clone()
        };
        token.cancelled().await;
        Ok(())
    }
}

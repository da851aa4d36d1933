//! The work queue contract and its implementations.
//!
//! - [`MemoryQueue`]: in-process FIFO with long-poll pulls and optional
//!   claim leases.
//! - [`HttpQueue`]: client for a remote queue server.

mod http;
mod memory;

pub use http::HttpQueue;
pub use memory::MemoryQueue;

use async_trait::async_trait;
use drover_core::WorkItem;

use crate::error::Result;

/// Ordered collection of pending work items.
///
/// `pull` is the claim and `ack` the completion of a unit of work. An item
/// is never handed to two concurrent pullers before it is acknowledged or
/// re-published. Each pull stamps the item with a fresh claim token;
/// `ack`, `extend`, `requeue` and `cancelled` only act on the claim the
/// caller holds.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Appends an item to the tail.
    async fn publish(&self, item: WorkItem) -> Result<()>;

    /// Cancels an item. A pending item is dropped; for a claimed one the
    /// consumer is signalled through [`cancelled`](WorkQueue::cancelled)
    /// and still acknowledges it.
    async fn remove(&self, item: &WorkItem) -> Result<()>;

    /// Blocks until an item is available, then claims it.
    async fn pull(&self) -> Result<WorkItem>;

    /// Completes a claimed item.
    async fn ack(&self, item: &WorkItem) -> Result<()>;

    /// Lists pending and claimed items.
    async fn items(&self) -> Result<Vec<WorkItem>>;

    /// Renews the claim on an item.
    async fn extend(&self, item: &WorkItem) -> Result<()> {
        let _ = item;
        Ok(())
    }

    /// Gives up a claim without completing it, so another puller can take
    /// the item.
    async fn requeue(&self, item: &WorkItem) -> Result<()> {
        self.ack(item).await?;
        let mut item = item.clone();
        item.claim = 0;
        self.publish(item).await
    }

    /// Resolves once the claimed item is cancelled. Never resolves for
    /// queues without out-of-band cancellation.
    async fn cancelled(&self, item: &WorkItem) -> Result<()> {
        let _ = item;
        std::future::pending::<()>().await;
        Ok(())
    }
}

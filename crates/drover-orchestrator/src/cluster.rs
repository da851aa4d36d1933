//! Worker pool of backend clients.
//!
//! Allocated clients sit in a bounded reservation channel. A dispatcher
//! claims the next free one with [`Cluster::reserve`] and gets a
//! [`Reservation`] that puts the client back exactly once, either through
//! [`Reservation::release`] or on drop.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_channel::TrySendError;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};

/// Default bound of the reservation channel, and so of the pool size.
pub const DEFAULT_POOL_CAPACITY: usize = 999;

/// Pool of allocated clients with a reservation channel.
///
/// Every allocation gets a generation number that travels with the client
/// through the channel. Entries whose generation no longer matches the
/// allocation set (the client was deallocated, possibly re-allocated) are
/// discarded when reserved or released.
pub struct Cluster<C> {
    inner: Arc<Inner<C>>,
}

struct Inner<C> {
    clients: RwLock<HashMap<C, u64>>,
    next_generation: AtomicU64,
    tx: async_channel::Sender<(C, u64)>,
    rx: async_channel::Receiver<(C, u64)>,
    capacity: usize,
}

impl<C> Clone for Cluster<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> Cluster<C>
where
    C: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Creates a pool bounded by [`DEFAULT_POOL_CAPACITY`].
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Creates a pool holding at most `capacity` clients.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = async_channel::bounded(capacity);
        Self {
            inner: Arc::new(Inner {
                clients: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                tx,
                rx,
                capacity,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<C, u64>> {
        self.inner.clients.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<C, u64>> {
        self.inner.clients.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a client to the pool and makes it reservable.
    ///
    /// Returns false if the client is already allocated or the pool is
    /// full.
    pub fn allocate(&self, client: C) -> bool {
        let mut clients = self.write();
        if clients.contains_key(&client) {
            return false;
        }
        if clients.len() >= self.inner.capacity {
            warn!(client = ?client, capacity = self.inner.capacity, "worker pool is full");
            return false;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        clients.insert(client.clone(), generation);
        if !self.push(&clients, client.clone(), generation) {
            clients.remove(&client);
            return false;
        }

        info!(client = ?client, "client allocated");
        true
    }

    /// Returns true if the client is in the allocation set.
    pub fn is_allocated(&self, client: &C) -> bool {
        self.read().contains_key(client)
    }

    /// Removes a client from the allocation set.
    ///
    /// A reservation already holding the client finishes its work; when
    /// it is released the client is dropped instead of re-entering the
    /// pool. Returns false if the client was not allocated.
    pub fn deallocate(&self, client: &C) -> bool {
        let removed = self.write().remove(client).is_some();
        if removed {
            info!(client = ?client, "client deallocated");
        }
        removed
    }

    /// Returns a snapshot of the allocation set.
    pub fn list(&self) -> Vec<C> {
        self.read().keys().cloned().collect()
    }

    /// Returns the number of allocated clients.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if no client is allocated.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the pool bound.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Waits for the next free client.
    ///
    /// Fails with [`OrchestratorError::ClusterClosed`] once the pool is
    /// closed.
    pub async fn reserve(&self) -> Result<Reservation<C>> {
        loop {
            let (client, generation) = self
                .inner
                .rx
                .recv()
                .await
                .map_err(|_| OrchestratorError::ClusterClosed)?;

            if let Some(reservation) = self.claim(client, generation) {
                return Ok(reservation);
            }
        }
    }

    /// Claims a free client if one is immediately available.
    pub fn try_reserve(&self) -> Option<Reservation<C>> {
        while let Ok((client, generation)) = self.inner.rx.try_recv() {
            if let Some(reservation) = self.claim(client, generation) {
                return Some(reservation);
            }
        }
        None
    }

    fn claim(&self, client: C, generation: u64) -> Option<Reservation<C>> {
        if self.read().get(&client) != Some(&generation) {
            debug!(client = ?client, "discarding stale reservation entry");
            return None;
        }
        debug!(client = ?client, "client reserved");
        Some(Reservation {
            cluster: self.clone(),
            client,
            generation,
            released: false,
        })
    }

    /// Closes the reservation channel; pending and future `reserve` calls
    /// fail.
    pub fn close(&self) {
        self.inner.tx.close();
    }

    fn give_back(&self, client: &C, generation: u64) -> bool {
        let clients = self.write();
        if clients.get(client) != Some(&generation) {
            debug!(client = ?client, "released client is no longer allocated, dropping");
            return false;
        }
        let pushed = self.push(&clients, client.clone(), generation);
        if pushed {
            debug!(client = ?client, "client released");
        }
        pushed
    }

    /// Queues a live entry. Callers hold the allocation write lock, so no
    /// stale entry can be queued concurrently.
    ///
    /// Live entries never exceed the capacity; a full channel therefore
    /// holds stale entries, which are evicted before retrying.
    fn push(&self, clients: &HashMap<C, u64>, client: C, generation: u64) -> bool {
        let entry = match self.inner.tx.try_send((client, generation)) {
            Ok(()) => return true,
            Err(TrySendError::Closed((client, _))) => {
                warn!(client = ?client, "reservation channel closed");
                return false;
            }
            Err(TrySendError::Full(entry)) => entry,
        };

        self.evict_stale(clients);
        match self.inner.tx.try_send(entry) {
            Ok(()) => true,
            Err(e) => {
                warn!(client = ?e.into_inner().0, "reservation channel rejected client");
                false
            }
        }
    }

    fn evict_stale(&self, clients: &HashMap<C, u64>) {
        let mut live = Vec::new();
        let mut evicted = 0usize;
        while let Ok((client, generation)) = self.inner.rx.try_recv() {
            if clients.get(&client) == Some(&generation) {
                live.push((client, generation));
            } else {
                evicted += 1;
            }
        }
        debug!(evicted, live = live.len(), "evicted stale reservation entries");

        for entry in live {
            if let Err(e) = self.inner.tx.try_send(entry) {
                warn!(client = ?e.into_inner().0, "failed to requeue client");
            }
        }
    }
}

impl<C> Default for Cluster<C>
where
    C: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive claim on one client.
///
/// The client goes back to the pool exactly once: on
/// [`release`](Reservation::release) or when the reservation is dropped.
pub struct Reservation<C>
where
    C: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    cluster: Cluster<C>,
    client: C,
    generation: u64,
    released: bool,
}

impl<C> Reservation<C>
where
    C: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Returns the reserved client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the client to the pool. Returns false if the client was
    /// deallocated meanwhile and has been dropped.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.cluster.give_back(&self.client, self.generation)
    }
}

impl<C> Drop for Reservation<C>
where
    C: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.cluster.give_back(&self.client, self.generation);
        }
    }
}

impl<C> Debug for Reservation<C>
where
    C: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("client", &self.client)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn allocate_is_idempotent() {
        let cluster = Cluster::new();
        assert!(cluster.allocate("a"));
        assert!(!cluster.allocate("a"));
        assert!(cluster.is_allocated(&"a"));
        assert_eq!(cluster.len(), 1);
    }

    #[tokio::test]
    async fn reserves_return_every_allocated_client_once() {
        let cluster = Cluster::new();
        for c in ["a", "b", "c", "d"] {
            assert!(cluster.allocate(c));
        }

        let mut got = HashSet::new();
        let mut held = Vec::new();
        for _ in 0..4 {
            let r = cluster.reserve().await.unwrap();
            assert!(got.insert(*r.client()));
            held.push(r);
        }
        assert_eq!(got, HashSet::from(["a", "b", "c", "d"]));
        assert!(cluster.try_reserve().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_reserves_get_distinct_clients() {
        let cluster = Cluster::new();
        cluster.allocate("A");
        cluster.allocate("B");

        let c1 = cluster.clone();
        let c2 = cluster.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { c1.reserve().await.unwrap() }),
            tokio::spawn(async move { c2.reserve().await.unwrap() }),
        );
        let (r1, r2) = (r1.unwrap(), r2.unwrap());

        let mut got = vec![*r1.client(), *r2.client()];
        got.sort();
        assert_eq!(got, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn reserve_blocks_until_release() {
        let cluster = Cluster::new();
        cluster.allocate("only");

        let first = cluster.reserve().await.unwrap();
        let waiter = {
            let cluster = cluster.clone();
            tokio::spawn(async move { cluster.reserve().await.map(|r| *r.client()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert!(first.release());
        let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().unwrap();
        assert_eq!(got, "only");
    }

    #[tokio::test]
    async fn drop_releases_the_reservation() {
        let cluster = Cluster::new();
        cluster.allocate(7u32);

        {
            let _r = cluster.reserve().await.unwrap();
            assert!(cluster.try_reserve().is_none());
        }
        assert_eq!(cluster.try_reserve().map(|r| *r.client()), Some(7));
    }

    #[tokio::test]
    async fn release_after_deallocate_drops_the_client() {
        let cluster = Cluster::new();
        cluster.allocate("gone");

        let r = cluster.reserve().await.unwrap();
        assert!(cluster.deallocate(&"gone"));
        assert!(cluster.list().is_empty());

        assert!(!r.release());
        assert!(cluster.try_reserve().is_none());
    }

    #[tokio::test]
    async fn reallocated_client_is_not_duplicated() {
        let cluster = Cluster::new();
        cluster.allocate("x");

        let old = cluster.reserve().await.unwrap();
        cluster.deallocate(&"x");
        assert!(cluster.allocate("x"));

        // the old reservation belongs to the previous allocation
        assert!(!old.release());
        assert!(cluster.try_reserve().is_some());
        assert!(cluster.try_reserve().is_none());
    }

    #[tokio::test]
    async fn deallocated_client_is_skipped_by_reserve() {
        let cluster = Cluster::new();
        cluster.allocate("a");
        cluster.allocate("b");
        cluster.deallocate(&"a");

        let r = cluster.reserve().await.unwrap();
        assert_eq!(*r.client(), "b");
    }

    #[test]
    fn capacity_bounds_the_pool() {
        let cluster = Cluster::with_capacity(2);
        assert!(cluster.allocate(1));
        assert!(cluster.allocate(2));
        assert!(!cluster.allocate(3));
        assert_eq!(cluster.capacity(), 2);
        assert_eq!(Cluster::<u8>::new().capacity(), DEFAULT_POOL_CAPACITY);
    }

    #[tokio::test]
    async fn reallocating_after_deallocate_at_full_capacity() {
        let cluster = Cluster::with_capacity(1);
        assert!(cluster.allocate("a"));
        assert!(cluster.deallocate(&"a"));

        assert!(cluster.allocate("b"));
        assert_eq!(cluster.try_reserve().map(|r| *r.client()), Some("b"));
    }

    #[tokio::test]
    async fn release_evicts_stale_entries_instead_of_losing_the_client() {
        let cluster = Cluster::with_capacity(2);
        cluster.allocate("a");
        cluster.allocate("b");

        let held = cluster.try_reserve().unwrap();
        assert_eq!(*held.client(), "a");
        cluster.deallocate(&"b");
        assert!(cluster.allocate("c"));

        assert!(held.release());

        let mut reservable = HashSet::new();
        let mut kept = Vec::new();
        while let Some(r) = cluster.try_reserve() {
            reservable.insert(*r.client());
            kept.push(r);
        }
        assert_eq!(reservable, HashSet::from(["a", "c"]));
    }

    #[tokio::test]
    async fn close_fails_reserve() {
        let cluster: Cluster<&str> = Cluster::new();
        cluster.close();
        assert!(matches!(
            cluster.reserve().await,
            Err(OrchestratorError::ClusterClosed)
        ));
    }

    #[test]
    fn list_is_a_snapshot() {
        let cluster = Cluster::new();
        cluster.allocate("a");
        let snapshot = cluster.list();
        cluster.allocate("b");
        assert_eq!(snapshot, vec!["a"]);
        assert_eq!(cluster.list().len(), 2);
    }
}

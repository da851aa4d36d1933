//! Keyed mutual exclusion for shared resources.
//!
//! [`LockManager`] is process-local: it serializes access between the
//! dispatch workers of one agent. Agents on different hosts need an
//! external coordination service. The manager is passed explicitly to
//! every component that needs it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{OrchestratorError, Result};

/// Table of per-key locks.
///
/// A record is created the first time a key is requested and stays in the
/// table for the life of the manager.
#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl LockManager {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    async fn record(&self, key: &str) -> Arc<Semaphore> {
        let mut table = self.table.lock().await;
        Arc::clone(
            table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }

    /// Acquires the lock for `key`, waiting as long as it takes.
    pub async fn acquire(&self, key: &str) -> Result<Lock> {
        let record = self.record(key).await;
        let permit = record
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::lock_cancelled(key))?;
        debug!(key = %key, "lock acquired");
        Ok(Lock::held(key, permit))
    }

    /// Acquires the lock for `key`, failing with
    /// [`OrchestratorError::LockTimeout`] once `timeout` elapses.
    pub async fn acquire_timeout(&self, key: &str, timeout: Duration) -> Result<Lock> {
        match tokio::time::timeout(timeout, self.acquire(key)).await {
            Ok(lock) => lock,
            Err(_) => {
                debug!(key = %key, timeout_ms = timeout.as_millis() as u64, "lock acquisition timed out");
                Err(OrchestratorError::lock_timeout(key))
            }
        }
    }

    /// Acquires the lock for `key` unless `cancel` fires first.
    pub async fn acquire_cancellable(&self, key: &str, cancel: &CancellationToken) -> Result<Lock> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OrchestratorError::lock_cancelled(key)),
            lock = self.acquire(key) => lock,
        }
    }

    /// Takes the lock only if it is free right now.
    pub async fn try_acquire(&self, key: &str) -> Option<Lock> {
        let record = self.record(key).await;
        let permit = record.try_acquire_owned().ok()?;
        Some(Lock::held(key, permit))
    }

    /// Returns true if some holder currently owns `key`.
    pub async fn is_locked(&self, key: &str) -> bool {
        self.table
            .lock()
            .await
            .get(key)
            .is_some_and(|s| s.available_permits() == 0)
    }

    /// Returns the number of keys ever requested.
    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }

    /// Returns true if no key was ever requested.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// An acquired lock. Dropping it releases the key.
#[derive(Debug)]
pub struct Lock {
    key: String,
    permit: Option<OwnedSemaphorePermit>,
}

impl Lock {
    fn held(key: &str, permit: OwnedSemaphorePermit) -> Self {
        Self {
            key: key.to_string(),
            permit: Some(permit),
        }
    }

    /// Returns the key this lock protects.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns true until the lock is released.
    pub fn locked(&self) -> bool {
        self.permit.is_some()
    }

    /// Releases the lock. Returns false if it was already released.
    pub fn release(&mut self) -> bool {
        match self.permit.take() {
            Some(permit) => {
                drop(permit);
                debug!(key = %self.key, "lock released");
                true
            }
            None => {
                trace!(key = %self.key, "lock already released");
                false
            }
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquires every key in sorted order, each bounded by `timeout`.
///
/// Sorting gives every caller the same acquisition order. On failure the
/// locks taken so far are released.
pub async fn acquire_all(
    manager: &LockManager,
    keys: &[String],
    timeout: Duration,
) -> Result<Vec<Lock>> {
    let mut sorted: Vec<&String> = keys.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut locks = Vec::with_capacity(sorted.len());
    for key in sorted {
        locks.push(manager.acquire_timeout(key, timeout).await?);
    }
    Ok(locks)
}

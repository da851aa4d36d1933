use async_trait::async_trait;
use drover_core::{NetworkSpec, StepState, VolumeSpec};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::client::{ContainerClient, ContainerSpec};
use crate::backend::LogStream;
use crate::error::Result;
use crate::lock::LockManager;

/// Sidecar settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmbassadorConfig {
    /// Base container name; the endpoint id is appended.
    pub name: String,
    pub image: String,
    /// Path of the shared volume inside every container.
    pub volume: String,
    /// Long-running command keeping the sidecar alive.
    pub command: Vec<String>,
}

impl Default for AmbassadorConfig {
    fn default() -> Self {
        Self {
            name: "drover-ambassador".to_string(),
            image: "busybox:latest".to_string(),
            volume: "/drover".to_string(),
            command: vec!["/bin/sleep".to_string(), "86400".to_string()],
        }
    }
}

/// Counts the runs attached to each shared sidecar.
#[derive(Debug, Clone, Default)]
pub struct SidecarUsers {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl SidecarUsers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many runs use the sidecar behind `key`.
    pub fn count(&self, key: &str) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn join(&self, key: &str) {
        *self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_insert(0) += 1;
    }

    /// Returns the number of runs still attached.
    fn leave(&self, key: &str) -> usize {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(count) = counts.get_mut(key) else {
            return 0;
        };
        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            counts.remove(key);
        }
        remaining
    }
}

/// Shared-sidecar bookkeeping: the lock serializing creation and teardown
/// of one sidecar name, and the users counted under it.
#[derive(Debug, Clone)]
pub struct SharedSidecar {
    pub locks: Arc<LockManager>,
    pub key: String,
    pub users: SidecarUsers,
    pub lock_timeout: Duration,
}

/// Decorates a [`ContainerClient`] so every container it creates shares a
/// sidecar's volume and, unless a network mode is set explicitly, its
/// network namespace.
pub struct Ambassador<C> {
    inner: C,
    name: String,
    shared: Option<SharedSidecar>,
}

impl<C: ContainerClient> Ambassador<C> {
    /// Creates and starts the sidecar named `name`, owned by this client
    /// alone.
    ///
    /// If creation fails the image is pulled and creation retried once.
    pub async fn start(inner: C, name: impl Into<String>, config: &AmbassadorConfig) -> Result<Self> {
        let name = name.into();
        provision(&inner, &name, config).await?;
        Ok(Self {
            inner,
            name,
            shared: None,
        })
    }

    /// Attaches to the sidecar named `name`, creating it if no other run
    /// uses it yet. The sidecar is torn down when its last user closes.
    pub async fn start_shared(
        inner: C,
        name: impl Into<String>,
        config: &AmbassadorConfig,
        shared: SharedSidecar,
    ) -> Result<Self> {
        let name = name.into();
        let mut lock = shared.locks.acquire_timeout(&shared.key, shared.lock_timeout).await?;

        let attached = if shared.users.count(&shared.key) > 0 {
            debug!(ambassador = %name, "attaching to running ambassador");
            Ok(())
        } else {
            provision(&inner, &name, config).await
        };
        if attached.is_ok() {
            shared.users.join(&shared.key);
        }
        lock.release();
        attached?;

        Ok(Self {
            inner,
            name,
            shared: Some(shared),
        })
    }

    /// Returns the sidecar container name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the decorated client.
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: ContainerClient> ContainerClient for Ambassador<C> {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut spec = spec.clone();
        spec.volumes_from.push(self.name.clone());
        if spec.network_mode.is_none() {
            spec.network_mode = Some(format!("container:{}", self.name));
        }
        self.inner.create_container(&spec).await
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.inner.start_container(name).await
    }

    async fn stop_container(&self, name: &str, grace: Duration) -> Result<()> {
        self.inner.stop_container(name, grace).await
    }

    async fn kill_container(&self, name: &str) -> Result<()> {
        self.inner.kill_container(name).await
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.inner.remove_container(name).await
    }

    async fn wait_container(&self, name: &str) -> Result<StepState> {
        self.inner.wait_container(name).await
    }

    async fn container_logs(&self, name: &str) -> Result<LogStream> {
        self.inner.container_logs(name).await
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.inner.pull_image(image).await
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        self.inner.create_network(spec).await
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.inner.remove_network(name).await
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<()> {
        self.inner.create_volume(spec).await
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.inner.remove_volume(name).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    /// Stops, kills and removes the sidecar once no other run uses it.
    /// Each step is best-effort.
    async fn close(&self) -> Result<()> {
        let Some(shared) = &self.shared else {
            teardown(&self.inner, &self.name).await;
            return self.inner.close().await;
        };

        match shared.locks.acquire_timeout(&shared.key, shared.lock_timeout).await {
            Ok(mut lock) => {
                let remaining = shared.users.leave(&shared.key);
                if remaining == 0 {
                    teardown(&self.inner, &self.name).await;
                } else {
                    debug!(ambassador = %self.name, remaining, "ambassador still in use");
                }
                lock.release();
            }
            Err(e) => {
                shared.users.leave(&shared.key);
                warn!(ambassador = %self.name, error = %e, "ambassador left running");
            }
        }
        self.inner.close().await
    }
}

async fn provision<C: ContainerClient>(inner: &C, name: &str, config: &AmbassadorConfig) -> Result<()> {
    let spec = ContainerSpec {
        name: name.to_string(),
        image: config.image.clone(),
        entrypoint: Vec::new(),
        command: config.command.clone(),
        volumes: vec![config.volume.clone()],
        ..Default::default()
    };

    if let Err(e) = inner.create_container(&spec).await {
        warn!(ambassador = %name, error = %e, "ambassador create failed, pulling image");
        inner.pull_image(&spec.image).await?;
        inner.create_container(&spec).await?;
    }
    if let Err(e) = inner.start_container(name).await {
        if let Err(remove) = inner.remove_container(name).await {
            warn!(ambassador = %name, error = %remove, "failed to remove unstarted ambassador");
        }
        return Err(e);
    }

    info!(ambassador = %name, image = %config.image, "ambassador started");
    Ok(())
}

async fn teardown<C: ContainerClient>(inner: &C, name: &str) {
    if let Err(e) = inner.stop_container(name, Duration::from_secs(5)).await {
        warn!(ambassador = %name, error = %e, "failed to stop ambassador");
    }
    if let Err(e) = inner.kill_container(name).await {
        warn!(ambassador = %name, error = %e, "failed to kill ambassador");
    }
    if let Err(e) = inner.remove_container(name).await {
        warn!(ambassador = %name, error = %e, "failed to remove ambassador");
    }
    info!(ambassador = %name, "ambassador closed");
}

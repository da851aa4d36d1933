//! Container runtime backend.
//!
//! [`DockerEngine`] drives any [`ContainerClient`]. The factory opens a
//! [`BollardClient`] per run and, when configured, wraps it in an
//! [`Ambassador`] so all steps share one sidecar's volume and network.

mod ambassador;
mod client;
mod engine;
#[cfg(test)]
pub(crate) mod fake;

pub use ambassador::{Ambassador, AmbassadorConfig, SharedSidecar, SidecarUsers};
pub use client::{BollardClient, ContainerClient, ContainerSpec};
pub use engine::{DockerEngine, RUN_LABEL, STEP_LABEL};

use async_trait::async_trait;
use drover_core::{Endpoint, WorkItem};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::{BoxedEngine, EngineFactory};
use crate::error::Result;
use crate::lock::LockManager;

fn name_safe(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Returns a unique, runtime-safe prefix for one run of `item`.
pub fn run_prefix(item: &WorkItem) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("drover_{}_{}", name_safe(&item.id), &nonce[..8])
}

/// Lock key guarding an ambassador name on an endpoint.
pub fn ambassador_lock_key(endpoint: &Endpoint, name: &str) -> String {
    format!("ambassador/{}/{}", endpoint.id, name)
}

/// Opens [`DockerEngine`]s on docker endpoints.
pub struct DockerFactory {
    ambassador: Option<AmbassadorConfig>,
    locks: Arc<LockManager>,
    lock_timeout: Duration,
    sidecar_users: SidecarUsers,
}

impl DockerFactory {
    /// Creates a factory. With `ambassador` set every run on an endpoint
    /// shares that endpoint's sidecar.
    pub fn new(ambassador: Option<AmbassadorConfig>, locks: Arc<LockManager>, lock_timeout: Duration) -> Self {
        Self {
            ambassador,
            locks,
            lock_timeout,
            sidecar_users: SidecarUsers::new(),
        }
    }

    /// Builds an engine around an already-connected client.
    pub async fn engine_for<C>(&self, client: C, endpoint: &Endpoint, item: &WorkItem) -> Result<DockerEngine>
    where
        C: ContainerClient + 'static,
    {
        let prefix = run_prefix(item);

        let Some(config) = &self.ambassador else {
            return Ok(DockerEngine::new(Arc::new(client), prefix));
        };

        let name = format!("{}-{}", config.name, name_safe(&endpoint.id));
        let shared = SharedSidecar {
            locks: Arc::clone(&self.locks),
            key: ambassador_lock_key(endpoint, &name),
            users: self.sidecar_users.clone(),
            lock_timeout: self.lock_timeout,
        };
        let ambassador = Ambassador::start_shared(client, name, config, shared).await?;
        info!(endpoint = %endpoint, ambassador = %ambassador.name(), "ambassador attached to run");
        Ok(DockerEngine::new(Arc::new(ambassador), prefix))
    }
}

#[async_trait]
impl EngineFactory for DockerFactory {
    async fn connect(&self, endpoint: &Endpoint, item: &WorkItem) -> Result<BoxedEngine> {
        let client = BollardClient::connect(endpoint)?;
        let engine = self.engine_for(client, endpoint, item).await?;
        Ok(Arc::new(engine))
    }

    async fn ping(&self, endpoint: &Endpoint) -> Result<()> {
        BollardClient::connect(endpoint)?.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Engine;
    use drover_core::{PipelineConfig, Stage, Step};
    use super::fake::FakeClient;

    fn item(id: &str) -> WorkItem {
        WorkItem::new(
            id,
            PipelineConfig::new("p").stage(Stage::new("s").step(Step::new("a", "alpine"))),
        )
    }

    #[test]
    fn run_prefix_is_name_safe_and_unique() {
        let item = item("org/repo#42");
        let a = run_prefix(&item);
        let b = run_prefix(&item);

        assert!(a.starts_with("drover_org-repo-42_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn engine_without_ambassador() {
        let factory = DockerFactory::new(None, Arc::new(LockManager::new()), Duration::from_secs(1));
        let fake = Arc::new(FakeClient::new());
        let endpoint = Endpoint::docker("d1", "local");

        let engine = factory.engine_for(Arc::clone(&fake), &endpoint, &item("7")).await.unwrap();
        engine.exec(&Step::new("a", "alpine")).await.unwrap();

        let created = fake.created();
        assert_eq!(created.len(), 1);
        assert!(created[0].volumes_from.is_empty());
    }

    #[tokio::test]
    async fn engine_with_ambassador_shares_sidecar() {
        let locks = Arc::new(LockManager::new());
        let factory = DockerFactory::new(
            Some(AmbassadorConfig::default()),
            Arc::clone(&locks),
            Duration::from_secs(1),
        );
        let fake = Arc::new(FakeClient::new());
        let endpoint = Endpoint::docker("d1", "local");

        let engine = factory.engine_for(Arc::clone(&fake), &endpoint, &item("7")).await.unwrap();
        engine.exec(&Step::new("a", "alpine")).await.unwrap();

        let created = fake.created();
        assert_eq!(created[0].name, "drover-ambassador-d1");
        assert_eq!(created[1].volumes_from, vec!["drover-ambassador-d1"]);
        assert!(!locks.is_locked("ambassador/d1/drover-ambassador-d1").await);

        engine.destroy(&PipelineConfig::new("p")).await.unwrap();
        assert!(fake.calls().contains(&"remove:drover-ambassador-d1".to_string()));
    }

    #[tokio::test]
    async fn concurrent_runs_on_an_endpoint_share_one_sidecar() {
        let factory = DockerFactory::new(
            Some(AmbassadorConfig::default()),
            Arc::new(LockManager::new()),
            Duration::from_secs(1),
        );
        let fake = Arc::new(FakeClient::new());
        let endpoint = Endpoint::docker("d1", "local");

        let (item7, item8) = (item("7"), item("8"));
        let (a, b) = tokio::join!(
            factory.engine_for(Arc::clone(&fake), &endpoint, &item7),
            factory.engine_for(Arc::clone(&fake), &endpoint, &item8),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        let sidecar_creates = fake
            .calls()
            .iter()
            .filter(|c| *c == "create:drover-ambassador-d1")
            .count();
        assert_eq!(sidecar_creates, 1);

        a.destroy(&PipelineConfig::new("p")).await.unwrap();
        assert!(!fake.calls().contains(&"remove:drover-ambassador-d1".to_string()));
        b.destroy(&PipelineConfig::new("p")).await.unwrap();
        assert!(fake.calls().contains(&"remove:drover-ambassador-d1".to_string()));
    }

    #[tokio::test]
    async fn ambassador_creation_waits_for_lock() {
        let locks = Arc::new(LockManager::new());
        let factory = DockerFactory::new(
            Some(AmbassadorConfig::default()),
            Arc::clone(&locks),
            Duration::from_millis(30),
        );
        let endpoint = Endpoint::docker("d1", "local");
        let _held = locks
            .acquire(&ambassador_lock_key(&endpoint, "drover-ambassador-d1"))
            .await
            .unwrap();

        let result = factory
            .engine_for(Arc::new(FakeClient::new()), &endpoint, &item("7"))
            .await;
        assert!(matches!(
            result,
            Err(crate::error::OrchestratorError::LockTimeout { .. })
        ));
    }
}

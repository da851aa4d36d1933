//! Compute backends.
//!
//! - [`docker`]: containers on a docker-compatible runtime
//! - [`kube`]: pods on a kubernetes cluster
//!
//! [`BackendFactory`] picks the backend from the endpoint kind.

pub mod docker;
pub mod kube;
mod r#trait;

pub use docker::{
    Ambassador, AmbassadorConfig, BollardClient, ContainerClient, ContainerSpec, DockerEngine, DockerFactory,
};
pub use kube::{KubeEngine, KubeFactory};
pub use r#trait::{BoxedEngine, Engine, EngineFactory, LogStream};

use async_trait::async_trait;
use drover_core::{Endpoint, EndpointKind, WorkItem};

use crate::error::Result;

/// Routes each endpoint to the factory for its kind.
pub struct BackendFactory {
    docker: DockerFactory,
    kube: KubeFactory,
}

impl BackendFactory {
    /// Creates a router over the two backend factories.
    pub fn new(docker: DockerFactory, kube: KubeFactory) -> Self {
        Self { docker, kube }
    }

    fn route(&self, endpoint: &Endpoint) -> &dyn EngineFactory {
        match endpoint.kind {
            EndpointKind::Docker => &self.docker,
            EndpointKind::Kubernetes => &self.kube,
        }
    }
}

#[async_trait]
impl EngineFactory for BackendFactory {
    async fn connect(&self, endpoint: &Endpoint, item: &WorkItem) -> Result<BoxedEngine> {
        self.route(endpoint).connect(endpoint, item).await
    }

    async fn ping(&self, endpoint: &Endpoint) -> Result<()> {
        self.route(endpoint).ping(endpoint).await
    }
}

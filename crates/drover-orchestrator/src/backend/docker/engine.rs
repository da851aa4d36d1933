use async_trait::async_trait;
use drover_core::{NetworkSpec, PipelineConfig, Step, StepState, VolumeSpec};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::client::{ContainerClient, ContainerSpec};
use crate::backend::{Engine, LogStream};
use crate::error::{OrchestratorError, Result};

/// Label carrying the run prefix on every created container.
pub const RUN_LABEL: &str = "drover.run";
/// Label carrying the step name.
pub const STEP_LABEL: &str = "drover.step";

/// Resources created for the current pipeline.
#[derive(Debug, Default)]
struct Environment {
    volumes: Vec<String>,
    networks: Vec<String>,
    containers: Vec<String>,
    /// Pipeline volume name to runtime volume name.
    volume_names: HashMap<String, String>,
}

/// [`Engine`] running steps as containers on one runtime.
///
/// Every runtime object gets the run prefix so concurrent pipelines on the
/// same daemon do not collide.
pub struct DockerEngine {
    client: Arc<dyn ContainerClient>,
    prefix: String,
    stop_grace: Duration,
    env: Mutex<Environment>,
}

impl DockerEngine {
    /// Creates an engine whose objects are named `<prefix>_<name>`.
    pub fn new(client: Arc<dyn ContainerClient>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            stop_grace: Duration::from_secs(10),
            env: Mutex::new(Environment::default()),
        }
    }

    /// Returns the run prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn scoped(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }

    /// Returns the container name of a step.
    pub fn container_name(&self, step: &Step) -> String {
        self.scoped(&step.name)
    }

    fn container_spec(&self, step: &Step, env: &Environment) -> ContainerSpec {
        let binds = step
            .volumes
            .iter()
            .map(|bind| match bind.split_once(':') {
                Some((source, rest)) => match env.volume_names.get(source) {
                    Some(scoped) => format!("{scoped}:{rest}"),
                    None => bind.clone(),
                },
                None => bind.clone(),
            })
            .collect();

        let labels = HashMap::from([
            (RUN_LABEL.to_string(), self.prefix.clone()),
            (STEP_LABEL.to_string(), step.name.clone()),
        ]);

        ContainerSpec {
            name: self.container_name(step),
            image: step.image.clone(),
            entrypoint: step.entrypoint.clone(),
            command: step.command.clone(),
            env: step.env_pairs(),
            labels,
            volumes: Vec::new(),
            binds,
            volumes_from: Vec::new(),
            network_mode: step.network_mode.clone(),
            networks: env.networks.clone(),
            alias: Some(step.name.clone()),
            working_dir: step.working_dir.clone(),
            privileged: step.privileged,
        }
    }
}

#[async_trait]
impl Engine for DockerEngine {
    fn name(&self) -> &str {
        "docker"
    }

    async fn setup(&self, config: &PipelineConfig) -> Result<()> {
        let mut env = self.env.lock().await;

        for volume in &config.volumes {
            let name = self.scoped(&volume.name);
            if env.volumes.contains(&name) {
                continue;
            }
            self.client
                .create_volume(&VolumeSpec {
                    name: name.clone(),
                    driver: volume.driver.clone(),
                })
                .await?;
            env.volume_names.insert(volume.name.clone(), name.clone());
            env.volumes.push(name);
        }

        for network in &config.networks {
            let name = self.scoped(&network.name);
            if env.networks.contains(&name) {
                continue;
            }
            self.client
                .create_network(&NetworkSpec {
                    name: name.clone(),
                    driver: network.driver.clone(),
                })
                .await?;
            env.networks.push(name);
        }

        info!(
            run = %self.prefix,
            volumes = env.volumes.len(),
            networks = env.networks.len(),
            "pipeline environment ready"
        );
        Ok(())
    }

    async fn exec(&self, step: &Step) -> Result<()> {
        if step.pull {
            self.client.pull_image(&step.image).await?;
        }

        let spec = {
            let mut env = self.env.lock().await;
            let spec = self.container_spec(step, &env);
            if !env.containers.contains(&spec.name) {
                env.containers.push(spec.name.clone());
            }
            spec
        };

        match self.client.create_container(&spec).await {
            Ok(_) => {}
            Err(OrchestratorError::ImageNotFound(_)) => {
                debug!(image = %step.image, "image missing locally, pulling");
                self.client.pull_image(&step.image).await?;
                self.client.create_container(&spec).await?;
            }
            Err(e) => return Err(e),
        }

        self.client.start_container(&spec.name).await?;
        info!(step = %step.name, container = %spec.name, image = %step.image, "step started");
        Ok(())
    }

    async fn kill(&self, step: &Step) -> Result<()> {
        let name = self.container_name(step);
        self.client.kill_container(&name).await?;
        info!(step = %step.name, container = %name, "step killed");
        Ok(())
    }

    async fn wait(&self, step: &Step) -> Result<StepState> {
        self.client.wait_container(&self.container_name(step)).await
    }

    async fn tail(&self, step: &Step) -> Result<LogStream> {
        self.client.container_logs(&self.container_name(step)).await
    }

    async fn destroy(&self, config: &PipelineConfig) -> Result<()> {
        info!(run = %self.prefix, "tearing down pipeline environment");

        let env = std::mem::take(&mut *self.env.lock().await);
        let mut containers = env.containers;
        for step in config.steps() {
            let name = self.container_name(step);
            if !containers.contains(&name) {
                containers.push(name);
            }
        }

        let mut errors = Vec::new();

        for name in &containers {
            if let Err(e) = self.client.stop_container(name, self.stop_grace).await {
                if !e.is_not_found() {
                    warn!(container = %name, error = %e, "Failed to stop container");
                }
            }
            match self.client.remove_container(name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    error!(container = %name, error = %e, "Failed to remove container");
                    errors.push(e.to_string());
                }
            }
        }

        for name in &env.volumes {
            if let Err(e) = self.client.remove_volume(name).await {
                error!(volume = %name, error = %e, "Failed to remove volume");
                errors.push(e.to_string());
            }
        }

        for name in &env.networks {
            if let Err(e) = self.client.remove_network(name).await {
                error!(network = %name, error = %e, "Failed to remove network");
                errors.push(e.to_string());
            }
        }

        if let Err(e) = self.client.close().await {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            info!(run = %self.prefix, "pipeline environment removed");
            Ok(())
        } else {
            Err(OrchestratorError::teardown_failed(errors.join("; ")))
        }
    }
}

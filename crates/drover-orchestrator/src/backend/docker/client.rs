//! Container runtime capability interface and its Docker implementation.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::network::CreateNetworkOptions;
use bollard::service::{EndpointSettings, HostConfig};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use drover_core::{Endpoint, NetworkSpec, StepState, VolumeSpec};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::LogStream;
use crate::error::{OrchestratorError, Result};

/// Everything needed to create one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Anonymous volumes created at these container paths.
    pub volumes: Vec<String>,
    /// Bind mounts and named volumes (`source:target[:mode]`).
    pub binds: Vec<String>,
    /// Containers whose volumes are mounted into this one.
    pub volumes_from: Vec<String>,
    pub network_mode: Option<String>,
    /// Networks to attach, with the container's alias on them.
    pub networks: Vec<String>,
    pub alias: Option<String>,
    pub working_dir: Option<String>,
    pub privileged: bool,
}

/// Capability set the docker engine needs from a container runtime.
///
/// [`BollardClient`] talks to a real daemon; [`Ambassador`](super::Ambassador)
/// decorates any implementation.
#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// Creates a container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, name: &str) -> Result<()>;

    /// Stops a container, killing it after `grace`.
    async fn stop_container(&self, name: &str, grace: Duration) -> Result<()>;

    async fn kill_container(&self, name: &str) -> Result<()>;

    /// Force-removes a container and its anonymous volumes.
    async fn remove_container(&self, name: &str) -> Result<()>;

    /// Blocks until the container stops and reports how it ended.
    async fn wait_container(&self, name: &str) -> Result<StepState>;

    /// Follows the container's combined stdout and stderr.
    async fn container_logs(&self, name: &str) -> Result<LogStream>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()>;

    async fn remove_network(&self, name: &str) -> Result<()>;

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<()>;

    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Checks that the runtime answers.
    async fn ping(&self) -> Result<()>;

    /// Releases anything the client owns on the runtime.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<C: ContainerClient + ?Sized> ContainerClient for Arc<C> {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        (**self).create_container(spec).await
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        (**self).start_container(name).await
    }

    async fn stop_container(&self, name: &str, grace: Duration) -> Result<()> {
        (**self).stop_container(name, grace).await
    }

    async fn kill_container(&self, name: &str) -> Result<()> {
        (**self).kill_container(name).await
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        (**self).remove_container(name).await
    }

    async fn wait_container(&self, name: &str) -> Result<StepState> {
        (**self).wait_container(name).await
    }

    async fn container_logs(&self, name: &str) -> Result<LogStream> {
        (**self).container_logs(name).await
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        (**self).pull_image(image).await
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        (**self).create_network(spec).await
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        (**self).remove_network(name).await
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<()> {
        (**self).create_volume(spec).await
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        (**self).remove_volume(name).await
    }

    async fn ping(&self) -> Result<()> {
        (**self).ping().await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}

const CONNECT_TIMEOUT_SECS: u64 = 120;

fn is_status(err: &DockerError, code: u16) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

/// [`ContainerClient`] backed by a Docker daemon through bollard.
#[derive(Debug, Clone)]
pub struct BollardClient {
    docker: Docker,
}

impl BollardClient {
    /// Wraps an existing connection.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connects to the daemon described by `endpoint`.
    ///
    /// `unix://` addresses use the socket, `tcp://` and `http://` use
    /// plain HTTP unless TLS material is configured, and an empty address
    /// or `local` uses the environment defaults.
    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        let address = endpoint.address.as_str();
        let docker = if address.is_empty() || address == "local" {
            Docker::connect_with_local_defaults()?
        } else if address.starts_with("unix://") {
            Docker::connect_with_unix(address, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else if let Some(tls) = &endpoint.tls {
            Docker::connect_with_ssl(
                address,
                &tls.key,
                &tls.cert,
                &tls.ca,
                CONNECT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            )?
        } else {
            Docker::connect_with_http(address, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        };

        debug!(endpoint = %endpoint, "docker client created");
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerClient for BollardClient {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            volumes_from: (!spec.volumes_from.is_empty()).then(|| spec.volumes_from.clone()),
            network_mode: spec.network_mode.clone(),
            privileged: Some(spec.privileged),
            ..Default::default()
        };

        // user-defined networks only apply when the network mode is unset
        let networking_config = if spec.network_mode.is_none() && !spec.networks.is_empty() {
            let endpoints_config = spec
                .networks
                .iter()
                .map(|network| {
                    let settings = EndpointSettings {
                        aliases: spec.alias.clone().map(|a| vec![a]),
                        ..Default::default()
                    };
                    (network.clone(), settings)
                })
                .collect();
            Some(NetworkingConfig { endpoints_config })
        } else {
            None
        };

        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: (!spec.entrypoint.is_empty()).then(|| spec.entrypoint.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: Some(spec.env.clone()),
            volumes: (!spec.volumes.is_empty()).then(|| {
                spec.volumes
                    .iter()
                    .map(|path| (path.clone(), HashMap::new()))
                    .collect()
            }),
            labels: Some(spec.labels.clone()),
            working_dir: spec.working_dir.clone(),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        match self.docker.create_container(Some(options), config).await {
            Ok(response) => {
                debug!(container = %spec.name, id = %response.id, "Created container");
                Ok(response.id)
            }
            Err(e) if is_status(&e, 404) => Err(OrchestratorError::image_not_found(&spec.image)),
            Err(e) => Err(OrchestratorError::container_creation_failed(
                &spec.name,
                e.to_string(),
            )),
        }
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| OrchestratorError::container_start_failed(name, e.to_string()))?;
        debug!(container = %name, "Started container");
        Ok(())
    }

    async fn stop_container(&self, name: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Err(OrchestratorError::container_not_found(name)),
            // 304: already stopped
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn kill_container(&self, name: &str) -> Result<()> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        match self.docker.kill_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Err(OrchestratorError::container_not_found(name)),
            // 409: not running
            Err(e) if is_status(&e, 409) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => {
                debug!(container = %name, "Removed container");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Err(OrchestratorError::container_not_found(name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_container(&self, name: &str) -> Result<StepState> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(name, Some(options));
        while let Some(result) = stream.next().await {
            match result {
                Ok(_) => {}
                // non-zero exits surface as this error; the code is read below
                Err(DockerError::DockerContainerWaitError { .. }) => {}
                Err(e) if is_status(&e, 404) => {
                    return Err(OrchestratorError::container_not_found(name))
                }
                Err(e) => return Err(e.into()),
            }
        }

        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;
        let state = inspect.state.unwrap_or_default();

        Ok(StepState {
            exited: !state.running.unwrap_or(false),
            exit_code: state.exit_code.unwrap_or(0),
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn container_logs(&self, name: &str) -> Result<LogStream> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let stream = self
            .docker
            .logs(name, Some(options))
            .map(|chunk| chunk.map(|out| out.into_bytes()).map_err(OrchestratorError::from));
        Ok(stream.boxed())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image = %image, "Pulling image");

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(OrchestratorError::image_pull_failed(image, e.to_string()));
                }
            }
        }

        Ok(())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        let options = CreateNetworkOptions {
            name: spec.name.as_str(),
            driver: spec.driver.as_str(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_network(options)
            .await
            .map_err(|e| OrchestratorError::network_creation_failed(&spec.name, e.to_string()))?;

        debug!(network = %spec.name, id = ?response.id, "Created network");
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.docker.remove_network(name).await?;
        debug!(network = %name, "Removed network");
        Ok(())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<()> {
        let options = CreateVolumeOptions {
            name: spec.name.as_str(),
            driver: spec.driver.as_str(),
            ..Default::default()
        };
        self.docker.create_volume(options).await?;
        debug!(volume = %spec.name, "Created volume");
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await?;
        debug!(volume = %name, "Removed volume");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_status_is_detected() {
        let err = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such image".into(),
        };
        assert!(is_status(&err, 404));
        assert!(!is_status(&err, 409));
    }

    #[test]
    fn connect_over_http_does_not_dial() {
        let endpoint = Endpoint::docker("d1", "tcp://127.0.0.1:2375");
        assert!(BollardClient::connect(&endpoint).is_ok());
    }
}

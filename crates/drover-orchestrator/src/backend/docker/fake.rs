//! In-memory container runtime for tests.

use async_trait::async_trait;
use bytes::Bytes;
use drover_core::{NetworkSpec, StepState, VolumeSpec};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use super::client::{ContainerClient, ContainerSpec};
use crate::backend::LogStream;
use crate::error::{OrchestratorError, Result};

#[derive(Default)]
pub(crate) struct FakeClient {
    /// Every call, in order, as `op:target`.
    pub calls: Mutex<Vec<String>>,
    pub created: Mutex<Vec<ContainerSpec>>,
    /// Images that are not present until pulled.
    pub missing_images: Mutex<HashSet<String>>,
    /// Fail this many creates before succeeding.
    pub create_failures: Mutex<u32>,
    pub fail_pull: bool,
    pub fail_start: bool,
    pub fail_remove: bool,
    pub exit_codes: Mutex<HashMap<String, i64>>,
    pub logs: Mutex<HashMap<String, Vec<&'static str>>>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.created.lock().unwrap().clone()
    }

    pub fn missing(self, image: &str) -> Self {
        self.missing_images.lock().unwrap().insert(image.to_string());
        self
    }

    pub fn exit_code(self, container: &str, code: i64) -> Self {
        self.exit_codes.lock().unwrap().insert(container.to_string(), code);
        self
    }

    pub fn output(self, container: &str, chunks: Vec<&'static str>) -> Self {
        self.logs.lock().unwrap().insert(container.to_string(), chunks);
        self
    }

    fn record(&self, op: &str, target: &str) {
        self.calls.lock().unwrap().push(format!("{op}:{target}"));
    }
}

#[async_trait]
impl ContainerClient for FakeClient {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.record("create", &spec.name);
        {
            let mut failures = self.create_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(OrchestratorError::image_not_found(&spec.image));
            }
        }
        if self.missing_images.lock().unwrap().contains(&spec.image) {
            return Err(OrchestratorError::image_not_found(&spec.image));
        }
        self.created.lock().unwrap().push(spec.clone());
        Ok(format!("id-{}", spec.name))
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.record("start", name);
        if self.fail_start {
            return Err(OrchestratorError::container_start_failed(name, "exec format error"));
        }
        Ok(())
    }

    async fn stop_container(&self, name: &str, _grace: Duration) -> Result<()> {
        self.record("stop", name);
        Ok(())
    }

    async fn kill_container(&self, name: &str) -> Result<()> {
        self.record("kill", name);
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.record("remove", name);
        if self.fail_remove {
            return Err(OrchestratorError::container_not_found(name));
        }
        Ok(())
    }

    async fn wait_container(&self, name: &str) -> Result<StepState> {
        self.record("wait", name);
        let code = self.exit_codes.lock().unwrap().get(name).copied().unwrap_or(0);
        Ok(StepState::exited(code))
    }

    async fn container_logs(&self, name: &str) -> Result<LogStream> {
        self.record("logs", name);
        let chunks = self.logs.lock().unwrap().get(name).cloned().unwrap_or_default();
        Ok(futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes())))).boxed())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.record("pull", image);
        if self.fail_pull {
            return Err(OrchestratorError::image_pull_failed(image, "registry unreachable"));
        }
        self.missing_images.lock().unwrap().remove(image);
        Ok(())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        self.record("network-create", &spec.name);
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.record("network-remove", name);
        Ok(())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<()> {
        self.record("volume-create", &spec.name);
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.record("volume-remove", name);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.record("ping", "");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record("close", "");
        Ok(())
    }
}

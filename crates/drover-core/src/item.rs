//! Work items and pipeline descriptors.
//!
//! A [`WorkItem`] is the unit the work queue hands to dispatchers. Its
//! [`PipelineConfig`] is routed to a backend engine untouched: the
//! orchestrator only reads the step list, the secrets to mask and the shared
//! resources to lock.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::{CoreError, Result};

/// Default run timeout applied when an item does not carry one (one hour).
pub const DEFAULT_TIMEOUT_SECS: u64 = 60 * 60;

/// A unit of pipeline work awaiting execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Identity used for deduplication and acknowledgement.
    pub id: String,

    /// Pipeline environment and steps.
    pub config: PipelineConfig,

    /// Free-form labels (repository, build number, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Upper bound for the whole run, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Token of the current claim, assigned by the queue on pull. Zero
    /// while the item is unclaimed.
    #[serde(default)]
    pub claim: u64,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl WorkItem {
    /// Creates a work item with the default timeout.
    pub fn new(id: impl Into<String>, config: PipelineConfig) -> Self {
        Self {
            id: id.into(),
            config,
            labels: BTreeMap::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            claim: 0,
        }
    }

    /// Adds a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Sets the run timeout.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Checks the item before it is queued or executed.
    ///
    /// Rejects empty ids, steps without an image and duplicate step names
    /// (step names double as container names on the backend).
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CoreError::validation("work item id is empty"));
        }
        if self.config.name.trim().is_empty() {
            return Err(CoreError::validation(format!(
                "pipeline name is empty for item {}",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for step in self.config.steps() {
            if step.image.trim().is_empty() {
                return Err(CoreError::validation(format!(
                    "step {} has no image",
                    step.name
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(CoreError::validation(format!(
                    "duplicate step name {}",
                    step.name
                )));
            }
        }
        Ok(())
    }
}

/// Pipeline environment: the shared resources plus the ordered stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Unique name, used as prefix for backend resources.
    pub name: String,

    /// Stages, executed in order.
    pub stages: Vec<Stage>,

    /// Networks created at setup.
    pub networks: Vec<NetworkSpec>,

    /// Volumes created at setup.
    pub volumes: Vec<VolumeSpec>,

    /// Secrets available to steps.
    pub secrets: Vec<Secret>,

    /// Keys of shared resources that must be locked for the whole run.
    pub resources: Vec<String>,
}

impl PipelineConfig {
    /// Creates an empty pipeline.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Appends a stage.
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Adds a network.
    pub fn network(mut self, network: NetworkSpec) -> Self {
        self.networks.push(network);
        self
    }

    /// Adds a volume.
    pub fn volume(mut self, volume: VolumeSpec) -> Self {
        self.volumes.push(volume);
        self
    }

    /// Adds a secret.
    pub fn secret(mut self, secret: Secret) -> Self {
        self.secrets.push(secret);
        self
    }

    /// Declares a shared resource key.
    pub fn resource(mut self, key: impl Into<String>) -> Self {
        self.resources.push(key.into());
        self
    }

    /// Iterates over every step of every stage, in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.stages.iter().flat_map(|stage| stage.steps.iter())
    }

    /// Returns the secret values that must be redacted from output.
    pub fn masked_secrets(&self) -> Vec<String> {
        self.secrets
            .iter()
            .filter(|s| s.mask && !s.value.is_empty())
            .map(|s| s.value.clone())
            .collect()
    }
}

/// A group of steps that run concurrently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stage {
    /// Stage name.
    pub name: String,

    /// Steps in this stage.
    pub steps: Vec<Step>,
}

impl Stage {
    /// Creates an empty stage.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }
}

/// One container or process to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Step {
    /// Unique name within the pipeline; used as the container name.
    pub name: String,

    /// Display name used in log lines.
    pub alias: String,

    /// Image reference.
    pub image: String,

    /// Always pull the image before creating the container.
    pub pull: bool,

    /// Service step: the run does not wait for it to exit.
    pub detached: bool,

    /// Entrypoint override.
    pub entrypoint: Vec<String>,

    /// Command arguments.
    pub command: Vec<String>,

    /// Environment variables.
    pub environment: BTreeMap<String, String>,

    /// Bind mounts (`source:target[:mode]`).
    pub volumes: Vec<String>,

    /// Explicit network mode; when unset the backend decides.
    pub network_mode: Option<String>,

    /// Working directory inside the container.
    pub working_dir: Option<String>,

    /// Run with extended privileges.
    pub privileged: bool,

    /// Run when every previous step succeeded.
    pub on_success: bool,

    /// Run when a previous step failed.
    pub on_failure: bool,
}

impl Default for Step {
    fn default() -> Self {
        Self {
            name: String::new(),
            alias: String::new(),
            image: String::new(),
            pull: false,
            detached: false,
            entrypoint: Vec::new(),
            command: Vec::new(),
            environment: BTreeMap::new(),
            volumes: Vec::new(),
            network_mode: None,
            working_dir: None,
            privileged: false,
            on_success: true,
            on_failure: false,
        }
    }
}

impl Step {
    /// Creates a step; the alias defaults to the name.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            alias: name.clone(),
            name,
            image: image.into(),
            ..Default::default()
        }
    }

    /// Sets the command.
    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Sets the network mode.
    pub fn network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    /// Marks the step to run after a failure.
    pub fn on_failure(mut self, run: bool) -> Self {
        self.on_failure = run;
        self
    }

    /// Marks the step to run when everything before it succeeded.
    pub fn on_success(mut self, run: bool) -> Self {
        self.on_success = run;
        self
    }

    /// Forces an image pull before creation.
    pub fn pull(mut self, pull: bool) -> Self {
        self.pull = pull;
        self
    }

    /// Returns the name shown in log lines.
    pub fn display_name(&self) -> &str {
        if self.alias.is_empty() {
            &self.name
        } else {
            &self.alias
        }
    }

    /// Returns true if the step should run given the current run outcome.
    pub fn should_run(&self, failed: bool) -> bool {
        if failed {
            self.on_failure
        } else {
            self.on_success
        }
    }

    /// Returns the environment as `KEY=value` pairs.
    pub fn env_pairs(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Network created for the pipeline environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Network name.
    pub name: String,

    /// Network driver.
    #[serde(default = "default_network_driver")]
    pub driver: String,
}

fn default_network_driver() -> String {
    "bridge".to_string()
}

impl NetworkSpec {
    /// Creates a bridge network spec.
    pub fn bridge(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: default_network_driver(),
        }
    }
}

/// Volume created for the pipeline environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Volume name.
    pub name: String,

    /// Volume driver.
    #[serde(default = "default_volume_driver")]
    pub driver: String,
}

fn default_volume_driver() -> String {
    "local".to_string()
}

impl VolumeSpec {
    /// Creates a local volume spec.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: default_volume_driver(),
        }
    }
}

/// Named secret value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    /// Secret name.
    pub name: String,

    /// Secret value.
    pub value: String,

    /// Whether the value must be masked in step output.
    #[serde(default = "default_mask")]
    pub mask: bool,
}

fn default_mask() -> bool {
    true
}

impl Secret {
    /// Creates a masked secret.
    pub fn masked(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            mask: true,
        }
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("mask", &self.mask)
            .finish()
    }
}

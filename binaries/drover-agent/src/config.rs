//! Agent configuration.
//!
//! Loaded from a TOML file, overridden by CLI arguments, then validated.

use drover_core::Endpoint;
use drover_orchestrator::{AmbassadorConfig, DispatchConfig, DEFAULT_POOL_CAPACITY};
use drover_transport::QueueConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Agent configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent identification.
    pub agent: AgentIdentity,

    /// Work queue connection.
    pub queue: QueueConfig,

    /// Dispatcher tuning.
    pub dispatch: DispatchSettings,

    /// Ambassador sidecar for docker endpoints.
    pub ambassador: AmbassadorSettings,

    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Compute backends to register.
    pub endpoints: Vec<Endpoint>,
}

/// Agent identity configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentIdentity {
    /// Unique agent ID. Derived from the hostname when unset.
    pub id: Option<String>,

    /// Labels for agent categorization.
    pub labels: HashMap<String, String>,
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// Concurrent dispatch workers.
    pub workers: usize,

    /// Bound of the endpoint reservation channel.
    pub pool_capacity: usize,

    /// Pause after a failed pull in milliseconds.
    pub pull_retry_delay_ms: u64,

    /// Attempts for a retryable setup failure.
    pub setup_attempts: u32,

    /// Pause between setup attempts in milliseconds.
    pub setup_retry_delay_ms: u64,

    /// Resource lock timeout in seconds.
    pub lock_timeout_secs: u64,

    /// Claim renewal interval in seconds (0 = never). Must stay below
    /// `queue.lease_secs` when the queue expires claims.
    pub lease_interval_secs: u64,

    /// Run timeout for items that carry none, in seconds.
    pub run_timeout_secs: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            workers: 1,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            pull_retry_delay_ms: 5000,
            setup_attempts: 3,
            setup_retry_delay_ms: 2000,
            lock_timeout_secs: 60,
            lease_interval_secs: 30,
            run_timeout_secs: 60 * 60,
        }
    }
}

impl DispatchSettings {
    /// Returns the lock timeout as a Duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Converts to the dispatcher's runtime configuration.
    pub fn to_dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            workers: self.workers,
            pull_retry_delay: Duration::from_millis(self.pull_retry_delay_ms),
            setup_attempts: self.setup_attempts,
            setup_retry_delay: Duration::from_millis(self.setup_retry_delay_ms),
            lock_timeout: self.lock_timeout(),
            lease_interval: Duration::from_secs(self.lease_interval_secs),
            run_timeout: Duration::from_secs(self.run_timeout_secs),
        }
    }
}

/// Ambassador configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AmbassadorSettings {
    /// Whether every docker run gets a sidecar.
    pub enabled: bool,

    /// Sidecar container settings.
    #[serde(flatten)]
    pub container: AmbassadorConfig,
}

impl AmbassadorSettings {
    /// Returns the sidecar settings if enabled.
    pub fn enabled_config(&self) -> Option<AmbassadorConfig> {
        self.enabled.then(|| self.container.clone())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// Log format (pretty, json, compact).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AgentConfig {
    /// Loads configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merges CLI arguments into the configuration.
    pub fn merge_cli_args(&mut self, args: &super::CliArgs) {
        if let Some(ref id) = args.agent_id {
            self.agent.id = Some(id.clone());
        }

        if let Some(ref endpoint) = args.queue_endpoint {
            self.queue.kind = drover_transport::QueueKind::Http;
            self.queue.endpoint = endpoint.clone();
        }

        if let Some(workers) = args.workers {
            self.dispatch.workers = workers;
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid log level: {}", self.logging.level);
        }

        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            anyhow::bail!("Invalid log format: {}", self.logging.format);
        }

        self.queue.validate()?;

        if self.dispatch.workers == 0 {
            anyhow::bail!("dispatch.workers must be greater than 0");
        }
        if self.dispatch.pool_capacity == 0 {
            anyhow::bail!("dispatch.pool_capacity must be greater than 0");
        }
        let lease = self.queue.lease_secs;
        let renewal = self.dispatch.lease_interval_secs;
        if lease > 0 && (renewal == 0 || renewal >= lease) {
            anyhow::bail!(
                "dispatch.lease_interval_secs ({}) must be between 1 and queue.lease_secs ({}) exclusive",
                renewal,
                lease
            );
        }
        if self.endpoints.len() > self.dispatch.pool_capacity {
            anyhow::bail!(
                "{} endpoints configured but pool capacity is {}",
                self.endpoints.len(),
                self.dispatch.pool_capacity
            );
        }

        for endpoint in &self.endpoints {
            if endpoint.id.is_empty() {
                anyhow::bail!("Endpoint with address {} has no id", endpoint.address);
            }
            if let Some(ref tls) = endpoint.tls {
                for path in [&tls.cert, &tls.key, &tls.ca] {
                    if !path.exists() {
                        anyhow::bail!("TLS file for endpoint {} not found: {:?}", endpoint.id, path);
                    }
                }
            }
        }

        Ok(())
    }

    /// Returns the agent ID, generating one if not configured.
    pub fn agent_id(&self) -> String {
        self.agent.id.clone().unwrap_or_else(|| {
            let hostname = hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            let suffix = uuid::Uuid::new_v4().to_string()[..8].to_string();
            format!("{}-{}", hostname, suffix)
        })
    }
}

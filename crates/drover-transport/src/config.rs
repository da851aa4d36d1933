use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Which work queue implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// In-process [`MemoryQueue`](crate::MemoryQueue).
    #[default]
    Memory,
    /// Remote queue server through [`HttpQueue`](crate::HttpQueue).
    Http,
}

/// Work queue settings, the `[queue]` section of the agent config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub kind: QueueKind,
    /// Base URL of the queue server (http only).
    pub endpoint: String,
    /// Bearer token sent with every request (http only).
    pub token: Option<String>,
    pub connect_timeout_secs: u64,
    /// Timeout for every call except the long-poll pull.
    pub request_timeout_secs: u64,
    /// Claim lease for the memory queue; 0 disables expiry.
    pub lease_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: QueueKind::Memory,
            endpoint: String::new(),
            token: None,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            lease_secs: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConfigShape {
    Nested { queue: QueueConfig },
    Flat(QueueConfig),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid queue config: {0}")]
    Invalid(String),
}

impl QueueConfig {
    /// Parses queue config from a TOML string, either flat or under `[queue]`.
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        match toml::from_str::<ConfigShape>(input)? {
            ConfigShape::Nested { queue } => Ok(queue),
            ConfigShape::Flat(config) => Ok(config),
        }
    }

    /// Loads queue config from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.display().to_string();
        let content = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_str.clone(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path_str,
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind == QueueKind::Http {
            if self.endpoint.is_empty() {
                return Err(ConfigError::Invalid(
                    "http queue requires an endpoint".into(),
                ));
            }
            if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
                return Err(ConfigError::Invalid(format!(
                    "queue endpoint must be an http(s) URL: {}",
                    self.endpoint
                )));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_nested_queue_shape() {
        let input = r#"
[queue]
kind = "http"
endpoint = "https://ci.example.com"
token = "secret"
"#;

        let config = QueueConfig::from_toml_str(input).expect("config should parse");
        assert_eq!(config.kind, QueueKind::Http);
        assert_eq!(config.endpoint, "https://ci.example.com");
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.request_timeout_secs, 30);
        config.validate().expect("config should be valid");
    }

    #[test]
    fn parse_flat_shape() {
        let input = r#"
kind = "memory"
lease_secs = 120
"#;

        let config = QueueConfig::from_toml_str(input).expect("config should parse");
        assert_eq!(config.kind, QueueKind::Memory);
        assert_eq!(config.lease_secs, 120);
    }

    #[test]
    fn http_without_endpoint_is_invalid() {
        let config = QueueConfig {
            kind: QueueKind::Http,
            ..QueueConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = QueueConfig {
            kind: QueueKind::Http,
            endpoint: "ci.example.com".into(),
            ..QueueConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[queue]
kind = "http"
endpoint = "http://localhost:8000"
"#
        )
        .expect("temporary config should be written");

        let loaded = QueueConfig::from_file(file.path()).expect("config should load");
        assert_eq!(loaded.kind, QueueKind::Http);
        assert_eq!(loaded.endpoint, "http://localhost:8000");
    }

    #[test]
    fn missing_file_reports_path() {
        let err = QueueConfig::from_file("/nonexistent/drover-queue.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/drover-queue.toml"));
    }
}

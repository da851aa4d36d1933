//! Error types for the orchestrator crate.

use thiserror::Error;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur while reserving backends and running pipelines.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Container not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Image not found locally.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Failed to pull image.
    #[error("failed to pull image {image}: {reason}")]
    ImagePullFailed {
        /// The image that failed to pull.
        image: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Container creation failed.
    #[error("failed to create container {name}: {reason}")]
    ContainerCreationFailed {
        /// The container name.
        name: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Container start failed.
    #[error("failed to start container {container_id}: {reason}")]
    ContainerStartFailed {
        /// The container ID.
        container_id: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Step execution failed.
    #[error("exec failed in {step}: {reason}")]
    ExecFailed {
        /// The step name.
        step: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Network creation failed.
    #[error("failed to create network {name}: {reason}")]
    NetworkCreationFailed {
        /// The network name.
        name: String,
        /// The reason for the failure.
        reason: String,
    },

    /// Environment setup failed.
    #[error("setup failed: {0}")]
    SetupFailed(String),

    /// Teardown failed.
    #[error("teardown failed: {0}")]
    TeardownFailed(String),

    /// Timeout waiting for condition.
    #[error("timeout waiting for {condition}")]
    Timeout {
        /// The condition that timed out.
        condition: String,
    },

    /// Lock acquisition did not complete before its deadline.
    #[error("timed out acquiring lock {key}")]
    LockTimeout {
        /// The lock key.
        key: String,
    },

    /// Lock acquisition was cancelled.
    #[error("lock acquisition cancelled: {key}")]
    LockCancelled {
        /// The lock key.
        key: String,
    },

    /// The run was stopped by its deadline or a cancellation before setup
    /// completed.
    #[error("run stopped before setup completed")]
    RunStopped,

    /// The worker pool's reservation channel is closed.
    #[error("cluster closed")]
    ClusterClosed,

    /// Docker API error.
    #[error("Docker API error: {0}")]
    DockerApi(#[from] bollard::errors::Error),

    /// HTTP transport error talking to a cluster API server.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The cluster API server answered with an error status.
    #[error("kubernetes API error ({status}): {body}")]
    KubeApi {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Work queue or log sink error.
    #[error(transparent)]
    Transport(#[from] drover_transport::TransportError),

    /// Data model error.
    #[error(transparent)]
    Core(#[from] drover_core::CoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Creates a container not found error.
    pub fn container_not_found(id: impl Into<String>) -> Self {
        Self::ContainerNotFound(id.into())
    }

    /// Creates an image not found error.
    pub fn image_not_found(image: impl Into<String>) -> Self {
        Self::ImageNotFound(image.into())
    }

    /// Creates an image pull failed error.
    pub fn image_pull_failed(image: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ImagePullFailed {
            image: image.into(),
            reason: reason.into(),
        }
    }

    /// Creates a container creation failed error.
    pub fn container_creation_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ContainerCreationFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a container start failed error.
    pub fn container_start_failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ContainerStartFailed {
            container_id: id.into(),
            reason: reason.into(),
        }
    }

    /// Creates an exec failed error.
    pub fn exec_failed(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExecFailed {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// Creates a network creation failed error.
    pub fn network_creation_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NetworkCreationFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a setup failed error.
    pub fn setup_failed(reason: impl Into<String>) -> Self {
        Self::SetupFailed(reason.into())
    }

    /// Creates a teardown failed error.
    pub fn teardown_failed(reason: impl Into<String>) -> Self {
        Self::TeardownFailed(reason.into())
    }

    /// Creates a timeout error.
    pub fn timeout(condition: impl Into<String>) -> Self {
        Self::Timeout {
            condition: condition.into(),
        }
    }

    /// Creates a lock timeout error.
    pub fn lock_timeout(key: impl Into<String>) -> Self {
        Self::LockTimeout { key: key.into() }
    }

    /// Creates a lock cancelled error.
    pub fn lock_cancelled(key: impl Into<String>) -> Self {
        Self::LockCancelled { key: key.into() }
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::DockerApi(_) | Self::Http(_) | Self::Io(_) => true,
            Self::KubeApi { status, .. } => *status >= 500 || *status == 409,
            Self::Transport(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Returns true if this is a not found error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ContainerNotFound(_) | Self::ImageNotFound(_) => true,
            Self::KubeApi { status, .. } => *status == 404,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::container_not_found("abc123");
        assert_eq!(err.to_string(), "container not found: abc123");

        let err = OrchestratorError::lock_timeout("res1");
        assert_eq!(err.to_string(), "timed out acquiring lock res1");
    }

    #[test]
    fn test_error_retryable() {
        assert!(OrchestratorError::timeout("test").is_retryable());
        assert!(OrchestratorError::KubeApi {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!OrchestratorError::RunStopped.is_retryable());
        assert!(!OrchestratorError::setup_failed("denied").is_retryable());
        assert!(!OrchestratorError::lock_timeout("k").is_retryable());
    }

    #[test]
    fn test_error_is_not_found() {
        assert!(OrchestratorError::container_not_found("test").is_not_found());
        assert!(OrchestratorError::image_not_found("test").is_not_found());
        assert!(OrchestratorError::KubeApi {
            status: 404,
            body: String::new()
        }
        .is_not_found());
        assert!(!OrchestratorError::timeout("test").is_not_found());
    }
}

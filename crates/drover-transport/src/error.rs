//! Error types for the transport crate.

use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by queues and log sinks.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The queue was closed; blocked pulls return this.
    #[error("queue closed")]
    Closed,

    /// An item with the same id is already queued or claimed.
    #[error("duplicate work item: {0}")]
    Duplicate(String),

    /// No claimed item with this id.
    #[error("work item not found: {0}")]
    NotFound(String),

    /// The item failed validation.
    #[error(transparent)]
    Invalid(#[from] drover_core::CoreError),

    /// HTTP transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote end answered with an error status.
    #[error("remote error ({status}): {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// Encoding or decoding failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The log sink rejected a line or file.
    #[error("log sink error: {0}")]
    Sink(String),
}

impl TransportError {
    /// Creates a log sink error.
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    /// Returns true for failures worth retrying (network, 5xx).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_transient() {
        assert!(TransportError::Status {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!TransportError::Status {
            status: 404,
            body: String::new()
        }
        .is_transient());
        assert!(!TransportError::Closed.is_transient());
        assert!(!TransportError::NotFound("1".into()).is_transient());
    }
}

//! Error types for the core data model.

use thiserror::Error;

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while validating descriptors or driving state machines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A work item or pipeline descriptor is malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// An environment phase transition that the state machine forbids.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// The starting phase.
        from: String,
        /// The requested phase.
        to: String,
    },
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Creates an invalid transition error.
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::validation("empty id");
        assert_eq!(err.to_string(), "validation error: empty id");

        let err = CoreError::invalid_transition("created", "running");
        assert_eq!(
            err.to_string(),
            "invalid state transition from created to running"
        );
    }
}

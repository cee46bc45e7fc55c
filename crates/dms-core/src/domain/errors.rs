//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! primarily request and identifier validation failures.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid job identifier
    #[error("Invalid job id: {0}")]
    InvalidJobId(String),

    /// Invalid backup target identifier
    #[error("Invalid target id: {0}")]
    InvalidTargetId(String),

    /// Invalid or empty host name
    #[error("Invalid host: {0}")]
    InvalidHost(String),

    /// A required request field is missing
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Invalid ledger state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidJobId("abc".to_string());
        assert_eq!(err.to_string(), "Invalid job id: abc");

        let err = DomainError::MissingField("secret_ref".to_string());
        assert_eq!(err.to_string(), "Missing required field: secret_ref");

        let err = DomainError::InvalidTransition {
            from: "unmounted".to_string(),
            to: "mounted".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from unmounted to mounted"
        );
    }

    #[test]
    fn test_error_equality() {
        let err1 = DomainError::InvalidHost(String::new());
        let err2 = DomainError::InvalidHost(String::new());
        assert_eq!(err1, err2);
    }
}

//! Error types for the CodeServer operator

use thiserror::Error;

/// Main error type for CodeServer operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Status write raced with another writer (stale resourceVersion)
    #[error("conflict: {0}")]
    Conflict(String),

    /// The resource carries a true ServerErrored condition
    #[error("terminal error: {0}")]
    Terminal(String),

    /// Validation error for CRD specs or object metadata
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a terminal error with the given message
    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether another reconciliation attempt could succeed without user action
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Kube(_) | Self::Conflict(_))
    }
}

/// Returns true if the kube error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// Returns true if the kube error is an API 409
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    /// Story: a CodeServer marked Errored stops the controller for good
    ///
    /// The error policy must be able to tell a terminal resource apart from
    /// a flaky API server so that only the latter gets requeued.
    #[test]
    fn story_terminal_errors_are_not_retried() {
        let err = Error::terminal("default/ide is in ServerErrored state");
        assert!(err.to_string().contains("terminal error"));
        assert!(!err.is_retryable());

        let err = Error::validation("CodeServer has no namespace");
        assert!(!err.is_retryable());
    }

    /// Story: store errors and stale status writes are retried with backoff
    #[test]
    fn story_transient_errors_are_retried() {
        assert!(Error::Kube(api_error(500)).is_retryable());
        assert!(Error::conflict("status resourceVersion is stale").is_retryable());
    }

    #[test]
    fn test_status_code_helpers() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
        assert!(is_conflict(&api_error(409)));
        assert!(!is_conflict(&api_error(500)));
    }

    #[test]
    fn test_error_construction_ergonomics() {
        let name = "workspace-1";
        let err = Error::serialization(format!("cannot encode status for {}", name));
        assert!(err.to_string().contains("workspace-1"));

        match Error::conflict("stale") {
            Error::Conflict(msg) => assert_eq!(msg, "stale"),
            _ => panic!("Expected Conflict variant"),
        }
    }
}

//! Error types for the controller.
//!
//! API failures are classified by status code so the reconcilers can tell
//! expected states (not found, conflict) from infrastructure failures.

use std::time::Duration;
use thiserror::Error;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error not covered by a more specific variant
    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),

    /// The requested object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency conflict or already existing object
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The API server rejected the object, e.g. an immutable field changed
    #[error("Invalid: {0}")]
    Invalid(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Transient error that should be retried
    #[error("Transient error: {0}")]
    Transient(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The namespace controller no longer accepts requests
    #[error("Namespace controller for {0} is stopped")]
    ControllerStopped(String),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        let classified = match &err {
            kube::Error::Api(resp) => Some((resp.code, resp.message.clone())),
            _ => None,
        };
        match classified {
            Some((404, message)) => Error::NotFound(message),
            Some((409, message)) => Error::Conflict(message),
            Some((422, message)) => Error::Invalid(message),
            _ => Error::Kube(err),
        }
    }
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Check if this error is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Check if the server rejected the object as invalid
    pub fn is_invalid(&self) -> bool {
        matches!(self, Error::Invalid(_))
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Transient(_) | Error::Conflict(_) => true,
            Error::NotFound(_)
            | Error::Invalid(_)
            | Error::Validation(_)
            | Error::ControllerStopped(_) => false,
            Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(300)
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

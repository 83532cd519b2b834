//! Error types for the M3DB operator

use thiserror::Error;

use crate::retry::Transient;

/// Main error type for operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Admin API error from the M3 coordinator
    #[error("admin error: {0}")]
    Admin(#[from] crate::admin::AdminError),

    /// Validation error for the desired cluster document
    #[error("validation error: {0}")]
    Validation(String),

    /// A precondition is not yet observable (pod unbound, identity unresolved)
    #[error("not ready: {0}")]
    NotReady(String),

    /// A topology change would violate the placement safety predicate
    #[error("placement unstable: {0}")]
    Unstable(String),

    /// Conflicting concurrent modification detected
    #[error("conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invariant violation that should never happen
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-ready error with the given message
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    /// Create an unstable-placement error with the given message
    pub fn unstable(msg: impl Into<String>) -> Self {
        Self::Unstable(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl Transient for Error {
    /// Whether requeueing with backoff can make progress; validation,
    /// serialization, and invariant violations need a spec change instead
    fn is_transient(&self) -> bool {
        match self {
            Self::Kube(_) | Self::NotReady(_) | Self::Unstable(_) | Self::Conflict(_) => true,
            Self::Admin(e) => e.is_transient(),
            Self::Validation(_) | Self::Serialization(_) | Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_carry_message() {
        let err = Error::validation("replication factor 4 exceeds isolation group count 3");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("replication factor"));
        assert!(!err.is_transient());
    }

    #[test]
    fn unstable_errors_are_transient() {
        let err = Error::unstable("shard 12 INITIALIZING on instance a");
        assert!(err.is_transient());
        assert!(err.to_string().contains("placement unstable"));
    }

    #[test]
    fn conflict_errors_are_transient() {
        let err = Error::conflict("resource version changed during status write");
        assert!(err.is_transient());
    }

    #[test]
    fn categorization_for_requeue_policy() {
        fn should_backoff(err: &Error) -> bool {
            err.is_transient()
        }

        assert!(should_backoff(&Error::not_ready("pod g1-0 not bound to a node")));
        assert!(!should_backoff(&Error::internal("placement instance without shards")));
        assert!(!should_backoff(&Error::serialization("bad config template")));
    }
}

//! Error types for registration
//!
//! `RegistryError` is what callers of the registry see. `StoreError` is what a
//! coordination store reports; the lifecycle engine inspects it to tell an
//! expired lease apart from a transient failure.

use crate::addr::AddrError;
use crate::lifecycle::RegistrationState;
use crate::store::LeaseId;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a coordination store operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The lease expired or was revoked upstream. Retrying the keep-alive
    /// will never succeed; a new lease has to be granted.
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("{op} failed: {message}")]
    Rpc { op: &'static str, message: String },

    #[error("invalid store response: {0}")]
    InvalidResponse(String),
}

impl StoreError {
    pub fn rpc(op: &'static str, message: impl Into<String>) -> Self {
        Self::Rpc {
            op,
            message: message.into(),
        }
    }

    pub fn is_lease_not_found(&self) -> bool {
        matches!(self, StoreError::LeaseNotFound(_))
    }
}

/// Errors surfaced by the registry façade.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Invalid construction input, e.g. a missing service name.
    #[error("configuration error: {0}")]
    Config(String),

    /// None of the configured endpoints could be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The advertised address could not be determined.
    #[error("address resolution failed: {0}")]
    Address(#[from] AddrError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// `register` was called on a registry that already failed or was
    /// deregistered.
    #[error("registry is {0} and cannot register again")]
    Terminal(RegistrationState),
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_not_found_is_distinguished() {
        let lease = LeaseId::new(7).unwrap();
        assert!(StoreError::LeaseNotFound(lease).is_lease_not_found());
        assert!(!StoreError::rpc("put", "connection reset").is_lease_not_found());
        assert!(!StoreError::Timeout {
            op: "keep_alive",
            after: Duration::from_secs(5)
        }
        .is_lease_not_found());
    }

    #[test]
    fn test_error_messages() {
        let err = RegistryError::Config("service name required".to_string());
        assert_eq!(err.to_string(), "configuration error: service name required");

        let err = RegistryError::from(StoreError::rpc("grant_lease", "unavailable"));
        assert_eq!(err.to_string(), "store error: grant_lease failed: unavailable");

        let err = RegistryError::Terminal(RegistrationState::Deregistered);
        assert_eq!(
            err.to_string(),
            "registry is deregistered and cannot register again"
        );
    }
}

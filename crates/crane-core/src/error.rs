//! Error types for crane

use thiserror::Error;

/// Main error type for crane
#[derive(Error, Debug)]
pub enum CraneError {
    /// Not enough free capacity to satisfy a claim
    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// Mini-cluster exists but is not accepting work
    #[error("Mini-cluster not active: {0}")]
    MiniClusterNotActive(String),

    /// Mini-cluster not found
    #[error("Mini-cluster not found: {0}")]
    MiniClusterNotFound(String),

    /// Cargo not found
    #[error("Cargo not found: {0}")]
    CargoNotFound(String),

    /// Lease not found
    #[error("Lease not found: {0}")]
    LeaseNotFound(String),

    /// Lease is not in a state that allows the operation
    #[error("Lease not active: {0}")]
    LeaseNotActive(String),

    /// Node is not registered
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// Node still hosts active leases
    #[error("Node busy: {0}")]
    NodeBusy(String),

    /// Node is already registered
    #[error("Node already registered: {0}")]
    NodeExists(String),

    /// Substrate did not confirm a launch in time
    #[error("Launch timed out: {0}")]
    LaunchTimeout(String),

    /// Substrate has no record of a unit we believe is running
    #[error("Substrate does not track unit: {0}")]
    SubstrateUntracked(String),

    /// Tenant is not allowed to act on the resource
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Illegal lifecycle transition
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Substrate/runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Durable storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CraneError {
    /// Whether the caller may succeed by retrying later without changing the request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CraneError::InsufficientCapacity(_)
                | CraneError::LaunchTimeout(_)
                | CraneError::SubstrateUntracked(_)
        )
    }

    /// Whether the error means the referenced object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CraneError::MiniClusterNotFound(_)
                | CraneError::CargoNotFound(_)
                | CraneError::LeaseNotFound(_)
                | CraneError::UnknownNode(_)
        )
    }
}

/// Result type for crane operations
pub type CraneResult<T> = Result<T, CraneError>;

impl From<serde_json::Error> for CraneError {
    fn from(err: serde_json::Error) -> Self {
        CraneError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for CraneError {
    fn from(err: toml::de::Error) -> Self {
        CraneError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CraneError::InsufficientCapacity("node-1 has 0 GPU free".to_string());
        assert_eq!(err.to_string(), "Insufficient capacity: node-1 has 0 GPU free");

        let err = CraneError::InvalidTransition {
            from: "Released".to_string(),
            to: "Active".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from Released to Active"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CraneError = io_err.into();
        assert!(matches!(err, CraneError::Io(_)));
    }

    #[test]
    fn test_error_classification() {
        assert!(CraneError::InsufficientCapacity(String::new()).is_retryable());
        assert!(!CraneError::LeaseNotFound(String::new()).is_retryable());
        assert!(CraneError::UnknownNode(String::new()).is_not_found());
        assert!(!CraneError::PermissionDenied(String::new()).is_not_found());
    }
}

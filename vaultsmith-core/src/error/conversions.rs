//! From implementations for external error types

use super::types::VaultsmithError;

impl From<std::io::Error> for VaultsmithError {
    fn from(err: std::io::Error) -> Self {
        VaultsmithError::io("io_operation", err)
    }
}

impl From<serde_yaml::Error> for VaultsmithError {
    fn from(err: serde_yaml::Error) -> Self {
        VaultsmithError::serialization("yaml", err)
    }
}

impl From<openssl::error::ErrorStack> for VaultsmithError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        VaultsmithError::crypto("openssl", err)
    }
}

impl From<tokio::task::JoinError> for VaultsmithError {
    fn from(err: tokio::task::JoinError) -> Self {
        VaultsmithError::internal(format!("Task panicked: {}", err))
    }
}

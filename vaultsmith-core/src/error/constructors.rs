//! Constructor helpers for VaultsmithError

use super::types::VaultsmithError;

impl VaultsmithError {
    /// Create a configuration error naming the offending component
    ///
    /// # Examples
    /// ```rust
    /// use vaultsmith_core::error::VaultsmithError;
    ///
    /// let err = VaultsmithError::configuration("certificate", "key_usage_critical requires key_usage");
    /// assert!(!err.is_retryable());
    /// ```
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        VaultsmithError::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn inconsistent_state(message: impl Into<String>) -> Self {
        VaultsmithError::InconsistentState {
            message: message.into(),
        }
    }

    /// Create a retryable orchestration error for a pipeline step
    pub fn orchestration(step: impl Into<String>, message: impl Into<String>) -> Self {
        VaultsmithError::Orchestration {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn raft_not_converged(message: impl Into<String>) -> Self {
        VaultsmithError::RaftNotConverged {
            message: message.into(),
        }
    }

    /// The operator could not be asked; retrying would ask again
    pub fn operator_input(message: impl Into<String>) -> Self {
        VaultsmithError::OperatorInput {
            message: message.into(),
        }
    }

    pub fn safe_exit(reason: impl Into<String>) -> Self {
        VaultsmithError::SafeExit {
            reason: reason.into(),
        }
    }

    /// Storage failure wrapping the backend's own error
    pub fn storage<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        VaultsmithError::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Storage failure that has no underlying error value
    pub fn storage_message(operation: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        VaultsmithError::Storage {
            operation: operation.into(),
            source: message.into(),
        }
    }

    pub fn crypto(operation: impl Into<String>, source: openssl::error::ErrorStack) -> Self {
        VaultsmithError::Crypto {
            operation: operation.into(),
            source,
        }
    }

    pub fn certificate_parse(message: impl Into<String>) -> Self {
        VaultsmithError::CertificateParse {
            message: message.into(),
        }
    }

    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        VaultsmithError::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Encoding or decoding failure for a named format
    pub fn serialization<E: std::error::Error + Send + Sync + 'static>(
        operation: impl Into<String>,
        source: E,
    ) -> Self {
        VaultsmithError::Serialization {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn transport(endpoint: impl Into<String>, source: reqwest::Error) -> Self {
        VaultsmithError::Transport {
            endpoint: endpoint.into(),
            source,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        VaultsmithError::Internal {
            message: message.into(),
        }
    }
}

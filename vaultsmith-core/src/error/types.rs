//! Core error types for vaultsmith

use thiserror::Error;

/// How the orchestration loop should react to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient condition; re-run the whole pipeline after a pause
    Retryable,
    /// Retrying cannot help; surface immediately
    Fatal,
    /// Operator asked to stop; exit successfully
    SafeExit,
}

/// Error type for every vaultsmith operation
#[derive(Error, Debug)]
pub enum VaultsmithError {
    // Configuration
    #[error("Configuration error in {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Inconsistent cluster state: {message}")]
    InconsistentState { message: String },

    // Orchestration
    #[error("No ready node found")]
    NoReadyNode,

    #[error("Raft membership has not converged: {message}")]
    RaftNotConverged { message: String },

    #[error("Vault node {node_id} lost quorum: {message}")]
    QuorumLost { node_id: String, message: String },

    #[error("Step '{step}' failed: {message}")]
    Orchestration { step: String, message: String },

    // Vault API and transport
    #[error("Vault API error from {endpoint} ({status}): {}", .errors.join("; "))]
    VaultApi {
        endpoint: String,
        status: u16,
        errors: Vec<String>,
    },

    #[error("Request to {endpoint} failed")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Not authenticated against {endpoint}")]
    Unauthenticated { endpoint: String },

    // Storage
    #[error("Storage operation failed: {operation}")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Object not found in storage: {key}")]
    NotFound { key: String },

    // Crypto
    #[error("Cryptographic operation failed: {operation}")]
    Crypto {
        operation: String,
        #[source]
        source: openssl::error::ErrorStack,
    },

    #[error("Certificate could not be parsed: {message}")]
    CertificateParse { message: String },

    // I/O and serialization
    #[error("I/O error during {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error during {operation}")]
    Serialization {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Control flow
    #[error("Safe exit: {reason}")]
    SafeExit { reason: String },

    #[error("Interrupted by operator")]
    Interrupted,

    #[error("Cannot read operator input: {message}")]
    OperatorInput { message: String },

    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<VaultsmithError>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl VaultsmithError {
    /// Classify this error for the orchestration loop
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultsmithError::Configuration { .. }
            | VaultsmithError::InconsistentState { .. }
            | VaultsmithError::Interrupted
            | VaultsmithError::OperatorInput { .. }
            | VaultsmithError::RetriesExhausted { .. } => ErrorKind::Fatal,
            VaultsmithError::SafeExit { .. } => ErrorKind::SafeExit,
            _ => ErrorKind::Retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    /// Status code of a Vault API error, if this is one
    pub fn vault_status(&self) -> Option<u16> {
        match self {
            VaultsmithError::VaultApi { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type alias for vaultsmith operations
pub type Result<T> = std::result::Result<T, VaultsmithError>;

/// Explicit alias, preferred in public signatures
pub type VaultsmithResult<T> = Result<T>;

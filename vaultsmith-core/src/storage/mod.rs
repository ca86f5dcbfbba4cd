//! Durable blob storage for cluster state
//!
//! Unseal keys, Terraform state, Raft snapshots and the cluster
//! configuration itself live behind [`StorageBackend`]. Two durable
//! implementations are selected by [`StorageConfig`]:
//!
//! - [`LocalStorage`]: a directory on the local filesystem, with atomic
//!   replace-on-write and a JSON sidecar per object tracking its version
//! - [`S3Storage`]: an S3-compatible bucket with customer supplied AES-256
//!   keys (SSE-C) and mandatory bucket versioning
//!
//! [`MemoryStorage`] keeps everything in process and exists for tests.
//!
//! Every `write` has completed durably by the time it returns.

mod cluster_store;
pub mod local;
pub mod memory;
pub mod s3;
mod sigv4;

pub use cluster_store::{ClusterStore, UnsealBundle};
pub use local::{LocalStorage, LocalStorageConfig};
pub use memory::MemoryStorage;
pub use s3::{S3Storage, S3StorageConfig};

use crate::error::VaultsmithResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Storage key for the nested cluster configuration blob
pub const VAULT_CONFIG_KEY: &str = "vault_config.yml";
/// Storage key for the unseal material returned by initialisation
pub const UNSEAL_KEYS_KEY: &str = "vault_unseal_keys.yml";
/// Storage key for Terraform state
pub const TERRAFORM_STATE_KEY: &str = "terraform.tfstate";
/// Storage key for the latest Raft snapshot
pub const RAFT_SNAPSHOT_KEY: &str = "vault_raft_snapshot.snap";

pub const CONTENT_TYPE_YAML: &str = "text/yaml";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Identifier of the object version produced by a write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVersion(pub String);

impl std::fmt::Display for ObjectVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Blob store addressed by path
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read an object.
    ///
    /// A missing object yields `Ok(None)` unless `error_on_missing_file` is
    /// set, in which case it is a [`VaultsmithError::NotFound`] error.
    ///
    /// [`VaultsmithError::NotFound`]: crate::error::VaultsmithError::NotFound
    async fn read(&self, key: &str, error_on_missing_file: bool)
        -> VaultsmithResult<Option<Vec<u8>>>;

    /// Write an object, returning once it is durable
    async fn write(
        &self,
        key: &str,
        content: &[u8],
        content_type: &str,
    ) -> VaultsmithResult<ObjectVersion>;

    /// Short human readable description for logs
    fn describe(&self) -> String;
}

/// Storage backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    S3(S3StorageConfig),
    Local(LocalStorageConfig),
}

impl StorageConfig {
    /// Build the configured backend, running its construction-time checks
    pub async fn connect(&self) -> VaultsmithResult<Arc<dyn StorageBackend>> {
        match self {
            StorageConfig::S3(config) => Ok(Arc::new(S3Storage::connect(config.clone()).await?)),
            StorageConfig::Local(config) => Ok(Arc::new(LocalStorage::new(config.path.clone()).await?)),
        }
    }
}

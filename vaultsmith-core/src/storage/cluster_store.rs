//! Typed access to the well-known storage keys

use super::{
    StorageBackend, CONTENT_TYPE_JSON, CONTENT_TYPE_OCTET_STREAM, CONTENT_TYPE_YAML,
    RAFT_SNAPSHOT_KEY, TERRAFORM_STATE_KEY, UNSEAL_KEYS_KEY, VAULT_CONFIG_KEY,
};
use crate::config::VaultConfig;
use crate::error::{VaultsmithError, VaultsmithResult};
use crate::types::Secret;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Unseal material returned by `sys/init`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsealBundle {
    pub keys: Vec<Secret>,
    pub keys_base64: Vec<Secret>,
    pub root_token: Secret,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_shares: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_threshold: Option<u32>,
}

impl UnsealBundle {
    /// Unseal keys as hex, decoded from their base64 form
    pub fn hex_keys(&self) -> VaultsmithResult<Vec<Secret>> {
        self.keys_base64
            .iter()
            .enumerate()
            .map(|(index, key)| {
                BASE64
                    .decode(key.expose())
                    .map(|bytes| Secret::new(hex::encode(bytes)))
                    .map_err(|e| {
                        VaultsmithError::inconsistent_state(format!(
                            "stored unseal key {} is not valid base64: {}",
                            index, e
                        ))
                    })
            })
            .collect()
    }
}

/// Cluster state persisted in the storage backend
#[derive(Clone)]
pub struct ClusterStore {
    backend: Arc<dyn StorageBackend>,
}

impl ClusterStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub async fn load_vault_config(&self) -> VaultsmithResult<VaultConfig> {
        let bytes = self
            .backend
            .read(VAULT_CONFIG_KEY, false)
            .await?
            .ok_or_else(|| {
                VaultsmithError::configuration(
                    "vault_config",
                    format!(
                        "{} not found in storage and no inline vault_config given",
                        VAULT_CONFIG_KEY
                    ),
                )
            })?;
        VaultConfig::from_yaml_slice(&bytes)
    }

    pub async fn save_vault_config(&self, config: &VaultConfig) -> VaultsmithResult<()> {
        let yaml = serde_yaml::to_string(config)?;
        self.backend
            .write(VAULT_CONFIG_KEY, yaml.as_bytes(), CONTENT_TYPE_YAML)
            .await?;
        Ok(())
    }

    pub async fn unseal_keys(&self) -> VaultsmithResult<Option<UnsealBundle>> {
        match self.backend.read(UNSEAL_KEYS_KEY, false).await? {
            Some(bytes) => {
                let bundle = serde_yaml::from_slice(&bytes).map_err(|e| {
                    VaultsmithError::inconsistent_state(format!(
                        "{} is not a valid unseal bundle: {}",
                        UNSEAL_KEYS_KEY, e
                    ))
                })?;
                Ok(Some(bundle))
            }
            None => Ok(None),
        }
    }

    pub async fn save_unseal_keys(&self, bundle: &UnsealBundle) -> VaultsmithResult<()> {
        let yaml = serde_yaml::to_string(bundle)?;
        let version = self
            .backend
            .write(UNSEAL_KEYS_KEY, yaml.as_bytes(), CONTENT_TYPE_YAML)
            .await?;
        info!("Stored unseal keys in {} (version {})", self.backend.describe(), version);
        Ok(())
    }

    pub async fn terraform_state(&self) -> VaultsmithResult<Option<Vec<u8>>> {
        self.backend.read(TERRAFORM_STATE_KEY, false).await
    }

    pub async fn save_terraform_state(&self, state: &[u8]) -> VaultsmithResult<()> {
        self.backend
            .write(TERRAFORM_STATE_KEY, state, CONTENT_TYPE_JSON)
            .await?;
        Ok(())
    }

    pub async fn save_raft_snapshot(&self, snapshot: &[u8]) -> VaultsmithResult<()> {
        let version = self
            .backend
            .write(RAFT_SNAPSHOT_KEY, snapshot, CONTENT_TYPE_OCTET_STREAM)
            .await?;
        info!(
            "Stored {} byte raft snapshot in {} (version {})",
            snapshot.len(),
            self.backend.describe(),
            version
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn bundle() -> UnsealBundle {
        UnsealBundle {
            keys: vec!["00ff".into()],
            keys_base64: vec![Secret::new(BASE64.encode([0x00, 0xff, 0x10]))],
            root_token: "hvs.root".into(),
            secret_shares: Some(1),
            secret_threshold: Some(1),
        }
    }

    #[test]
    fn hex_keys_decode_base64() {
        let keys = bundle().hex_keys().unwrap();
        assert_eq!(keys[0].expose(), "00ff10");
    }

    #[tokio::test]
    async fn unseal_bundle_round_trip() {
        let memory = Arc::new(MemoryStorage::new());
        let store = ClusterStore::new(memory.clone());

        assert!(store.unseal_keys().await.unwrap().is_none());
        store.save_unseal_keys(&bundle()).await.unwrap();

        let loaded = store.unseal_keys().await.unwrap().unwrap();
        assert_eq!(loaded.root_token.expose(), "hvs.root");
        assert_eq!(loaded.secret_threshold, Some(1));
        assert_eq!(memory.content_type(UNSEAL_KEYS_KEY).as_deref(), Some("text/yaml"));
    }

    #[tokio::test]
    async fn content_types_follow_keys() {
        let memory = Arc::new(MemoryStorage::new());
        let store = ClusterStore::new(memory.clone());

        store.save_terraform_state(b"{}").await.unwrap();
        store.save_raft_snapshot(&[1, 2, 3]).await.unwrap();

        assert_eq!(
            memory.content_type(TERRAFORM_STATE_KEY).as_deref(),
            Some("application/json")
        );
        assert_eq!(
            memory.content_type(RAFT_SNAPSHOT_KEY).as_deref(),
            Some("application/octet-stream")
        );
        assert_eq!(store.terraform_state().await.unwrap().as_deref(), Some(&b"{}"[..]));
    }

    #[tokio::test]
    async fn missing_vault_config_is_a_configuration_error() {
        let store = ClusterStore::new(Arc::new(MemoryStorage::new()));
        let err = store.load_vault_config().await.unwrap_err();

        assert!(matches!(err, VaultsmithError::Configuration { .. }), "{}", err);
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
        assert!(err.to_string().contains(VAULT_CONFIG_KEY), "{}", err);
    }
}

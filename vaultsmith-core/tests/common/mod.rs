//! Fixtures for end-to-end orchestration tests

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vaultsmith_core::config::{
    AdminUserpassDetails, OrchestrationSettings, RootPkiDetails, VaultConfig, VaultSecrets,
};
use vaultsmith_core::pki::{traditional_pem, CertificateAuthority};
use vaultsmith_core::storage::{ClusterStore, LocalStorageConfig, MemoryStorage, StorageConfig};
use vaultsmith_core::topology::{self, VaultServer};
use vaultsmith_core::vault_api::MockVaultCluster;
use vaultsmith_core::{
    ClusterConfig, ClusterOrchestrator, InfraApplier, InfraOutcome, InfraRequest, OperatorPrompt,
    Secret, VaultsmithResult,
};

pub const HA_HOSTNAME: &str = "vault.example.com";
pub const HA_URL: &str = "https://vault.example.com:8200";
pub const ADMIN_USER: &str = "admin";
pub const ADMIN_PASSWORD: &str = "correct horse battery";
pub const ADMIN_MOUNT: &str = "userpass";

/// Applier that must never run; the fixture configures no terraform dir
pub struct NoInfra;

#[async_trait]
impl InfraApplier for NoInfra {
    async fn apply(&self, _request: &InfraRequest) -> VaultsmithResult<InfraOutcome> {
        panic!("infrastructure apply should be skipped without a terraform dir");
    }
}

pub struct Fixture {
    pub tmp: TempDir,
    pub cluster: MockVaultCluster,
    pub storage: Arc<MemoryStorage>,
    pub store: ClusterStore,
    pub config: ClusterConfig,
}

fn servers(count: usize) -> BTreeMap<String, VaultServer> {
    let mut yaml = String::new();
    for i in 1..=count {
        yaml.push_str(&format!(
            "vault_{i}:\n  api_ip: 10.0.0.{i}\n  cluster_addr_fqdn: vault-{i}.internal\n  vault_nodes:\n    node_a:\n      node_port: {}\n      cluster_port: {}\n",
            8200 + i * 10,
            8201 + i * 10,
        ));
    }
    serde_yaml::from_str(&yaml).unwrap()
}

impl Fixture {
    pub fn new(node_count: usize) -> Self {
        let tmp = TempDir::new().unwrap();
        let scratch = tmp.path().join("scratch");

        let ca = CertificateAuthority::generate("Vaultsmith Test Root CA", 3650).unwrap();
        let ca_password = Secret::new("ca-key-password");
        let vault_servers = servers(node_count);

        let vault_secrets = VaultSecrets {
            vault_ha_hostname: HA_HOSTNAME.to_string(),
            vault_ha_port: 8200,
            root_pki_details: RootPkiDetails {
                root_ca_key_pem: Secret::new(traditional_pem(ca.private_key(), Some(&ca_password)).unwrap()),
                root_ca_cert_pem: ca.certificate_pem().unwrap(),
                root_ca_key_password: ca_password,
            },
            vault_admin_userpass_details: AdminUserpassDetails {
                vault_admin_user: ADMIN_USER.to_string(),
                vault_admin_password: Secret::new(ADMIN_PASSWORD),
                vault_admin_userpass_mount_path: ADMIN_MOUNT.to_string(),
                vault_admin_policy_name: "vault_admin".to_string(),
                vault_admin_client_cert_p12_passphrase: Secret::new("p12-passphrase"),
            },
            external_services: json!({
                "artifactory": {"url": "https://artifacts.example.com", "token": "t0k3n"},
                "smtp": {"host": "mail.example.com", "port": 587},
            })
            .as_object()
            .cloned()
            .unwrap(),
            github_details: None,
            bot_gpg_key: None,
            ansible_inventory: None,
        };

        let topology = topology::resolve(&vault_servers, HA_HOSTNAME, &scratch).unwrap();
        let cluster = MockVaultCluster::from_topology(&topology, HA_URL);

        let config = ClusterConfig {
            tmp_dir_path: scratch,
            config_dir_path: None,
            storage: StorageConfig::Local(LocalStorageConfig {
                path: tmp.path().join("store"),
            }),
            terraform_dir: None,
            orchestration: OrchestrationSettings {
                attempts: 2,
                retry_wait: Duration::from_millis(10),
            },
            vault_config: Some(VaultConfig {
                vault_servers,
                vault_secrets,
            }),
        };
        config.validate().unwrap();
        config.prepare_tmp_dir().unwrap();

        let storage = Arc::new(MemoryStorage::new());
        let store = ClusterStore::new(storage.clone());

        Self {
            tmp,
            cluster,
            storage,
            store,
            config,
        }
    }

    pub fn orchestrator(&self, prompt: Arc<dyn OperatorPrompt>) -> ClusterOrchestrator {
        self.orchestrator_with_store(self.store.clone(), prompt)
    }

    pub fn orchestrator_with_store(&self, store: ClusterStore, prompt: Arc<dyn OperatorPrompt>) -> ClusterOrchestrator {
        ClusterOrchestrator::new(
            self.config.clone(),
            store,
            Arc::new(self.cluster.clone()),
            prompt,
            Arc::new(NoInfra),
        )
    }

    /// API addresses of every node, in topology order
    pub fn node_addresses(&self) -> Vec<String> {
        let vault_config = self.config.vault_config.as_ref().unwrap();
        topology::resolve(&vault_config.vault_servers, HA_HOSTNAME, &self.config.tmp_dir_path)
            .unwrap()
            .nodes()
            .map(|node| node.api_addr.clone())
            .collect()
    }
}

//! Shared fixtures for step tests

use crate::config::{AdminUserpassDetails, RootPkiDetails, VaultSecrets};
use crate::ha_client::HaClient;
use crate::node_client::NodeClient;
use crate::pki::CertificateAuthority;
use crate::prompt::ScriptedPrompt;
use crate::steps::{initialize::initialize_cluster, unseal::unseal_nodes};
use crate::storage::{ClusterStore, MemoryStorage, UnsealBundle};
use crate::topology::{self, Topology, VaultServer};
use crate::types::Secret;
use crate::vault_api::MockVaultCluster;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

pub(crate) const HA_URL: &str = "https://vault.example.com:8200";

pub(crate) struct Harness {
    pub tmp: TempDir,
    pub ca: CertificateAuthority,
    pub topology: Topology,
    pub cluster: MockVaultCluster,
    pub nodes: Vec<NodeClient>,
    pub store: ClusterStore,
}

/// `count` single-node servers on 10.0.0.x with distinct ports
pub(crate) fn servers(count: usize) -> BTreeMap<String, VaultServer> {
    let mut yaml = String::new();
    for i in 1..=count {
        yaml.push_str(&format!(
            "vault_{i}:\n  api_ip: 10.0.0.{i}\n  cluster_ip: 10.0.0.{i}\n  vault_nodes:\n    node_a:\n      node_port: {}\n      cluster_port: {}\n",
            8200 + i * 10,
            8201 + i * 10,
        ));
    }
    serde_yaml::from_str(&yaml).unwrap()
}

impl Harness {
    pub async fn new(count: usize) -> Self {
        let tmp = TempDir::new().unwrap();
        let ca = CertificateAuthority::generate("test root", 365).unwrap();
        let topology = topology::resolve(&servers(count), "vault.example.com", tmp.path()).unwrap();
        let cluster = MockVaultCluster::from_topology(&topology, HA_URL);
        let nodes = NodeClient::materialize_all(topology.nodes(), &ca, &cluster)
            .await
            .unwrap();
        let store = ClusterStore::new(Arc::new(MemoryStorage::new()));
        Self {
            tmp,
            ca,
            topology,
            cluster,
            nodes,
            store,
        }
    }

    /// Initialized and unsealed, with the original root token on every node client
    pub async fn bootstrapped(count: usize) -> (Self, UnsealBundle) {
        let harness = Self::new(count).await;
        initialize_cluster(&harness.nodes, &harness.store, &ScriptedPrompt::accept(3, 2))
            .await
            .unwrap();
        unseal_nodes(&harness.nodes, &harness.store).await.unwrap();
        let bundle = harness.store.unseal_keys().await.unwrap().unwrap();
        for node in &harness.nodes {
            node.api().set_token(Some(bundle.root_token.clone()));
        }
        (harness, bundle)
    }

    pub async fn ha_client(&self) -> HaClient {
        HaClient::build(
            &self.topology,
            &vault_secrets(&self.ca),
            &self.ca,
            self.tmp.path(),
            &self.cluster,
        )
        .await
        .unwrap()
    }

    pub fn node(&self, node_id: &str) -> &NodeClient {
        self.nodes.iter().find(|n| n.node_id() == node_id).unwrap()
    }
}

/// Secrets matching [`HA_URL`], with admin user `admin` / `correct horse` at `userpass`
pub(crate) fn vault_secrets(ca: &CertificateAuthority) -> VaultSecrets {
    VaultSecrets {
        vault_ha_hostname: "vault.example.com".to_string(),
        vault_ha_port: 8200,
        root_pki_details: RootPkiDetails {
            root_ca_key_pem: Secret::default(),
            root_ca_cert_pem: ca.certificate_pem().unwrap(),
            root_ca_key_password: Secret::default(),
        },
        vault_admin_userpass_details: AdminUserpassDetails {
            vault_admin_user: "admin".to_string(),
            vault_admin_password: Secret::new("correct horse"),
            vault_admin_userpass_mount_path: "userpass".to_string(),
            vault_admin_policy_name: "admin".to_string(),
            vault_admin_client_cert_p12_passphrase: Secret::new("p12"),
        },
        external_services: Default::default(),
        github_details: None,
        bot_gpg_key: None,
        ansible_inventory: None,
    }
}

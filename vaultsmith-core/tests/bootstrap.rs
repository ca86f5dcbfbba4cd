//! End-to-end runs of the bootstrap pipeline against a simulated cluster

mod common;

use common::{Fixture, ADMIN_MOUNT, ADMIN_PASSWORD, ADMIN_USER};
use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use vaultsmith_core::storage::{ClusterStore, MemoryStorage, RAFT_SNAPSHOT_KEY, UNSEAL_KEYS_KEY};
use vaultsmith_core::vault_api::VaultApi;
use vaultsmith_core::{
    ErrorKind, OperatorPrompt, ScriptedPrompt, Secret, VaultsmithError, VaultsmithResult,
};

const NODE_IDS: [&str; 3] = ["vault_1-node_a", "vault_2-node_a", "vault_3-node_a"];

#[tokio::test]
async fn fresh_three_node_bootstrap() {
    let fixture = Fixture::new(3);
    let prompt = Arc::new(ScriptedPrompt::accept(5, 3));

    let ha = fixture.orchestrator(prompt.clone()).run().await.unwrap();

    // Initialized exactly once, through the first node, and keys persisted
    assert_eq!(fixture.cluster.init_calls(), 1);
    assert_eq!(prompt.times_asked(), 1);
    let bundle = fixture.store.unseal_keys().await.unwrap().unwrap();
    assert_eq!(bundle.keys_base64.len(), 5);
    assert!(fixture.storage.contains(UNSEAL_KEYS_KEY));

    // Every node unsealed and in raft
    for node_id in NODE_IDS {
        assert_eq!(fixture.cluster.is_sealed(node_id), Some(false), "{}", node_id);
    }
    assert_eq!(fixture.cluster.raft_members(), NODE_IDS.to_vec());
    assert_eq!(fixture.cluster.join_calls(), 2);
    assert_eq!(fixture.cluster.leader().as_deref(), Some("vault_1-node_a"));

    // A fresh root token was generated, then revoked with everything else
    assert_eq!(fixture.cluster.root_tokens_generated(), 1);

    // Admin user, PKI and external services are in place
    assert_eq!(
        fixture.cluster.user_policies(ADMIN_MOUNT, ADMIN_USER),
        Some(vec!["vault_admin".to_string(), "default".to_string()])
    );
    let issuers = fixture.cluster.issuers("root-ca");
    assert_eq!(issuers.len(), 1);
    assert_eq!(issuers.values().next().unwrap().issuer_name, "root-ca-issuer");
    assert_eq!(
        fixture.cluster.kv_secret("secret", "external_services/smtp"),
        json!({"host": "mail.example.com", "port": 587}).as_object().cloned()
    );

    // Snapshot stored
    assert_eq!(fixture.cluster.snapshot_calls(), 1);
    assert!(fixture.storage.contains(RAFT_SNAPSHOT_KEY));

    // The HA session authenticates against every node
    let token = ha.api().token().unwrap();
    for address in fixture.node_addresses() {
        let client = fixture.cluster.client(&address);
        client.set_token(Some(token.clone()));
        assert!(client.is_authenticated().await.unwrap(), "{}", address);
    }

    // Credentials written to the scratch directory
    let scratch = &fixture.config.tmp_dir_path;
    assert!(scratch.join("vault_root_ca_cert.pem").exists());
    assert!(scratch.join("vault_2-node_a/vault-client-cert.pem").exists());
    assert!(ha.artifacts().pkcs12_file.exists());
}

#[tokio::test]
async fn rerun_is_idempotent_and_rotates_root() {
    let fixture = Fixture::new(3);
    let prompt = Arc::new(ScriptedPrompt::accept(3, 2));

    fixture.orchestrator(prompt.clone()).run().await.unwrap();
    fixture.orchestrator(prompt.clone()).run().await.unwrap();

    assert_eq!(fixture.cluster.init_calls(), 1);
    assert_eq!(prompt.times_asked(), 1);
    assert_eq!(fixture.cluster.join_calls(), 2);
    assert_eq!(fixture.cluster.remove_calls(), 0);
    assert_eq!(fixture.cluster.root_tokens_generated(), 2);
    assert_eq!(fixture.cluster.snapshot_calls(), 2);
    assert_eq!(fixture.cluster.issuers("root-ca").len(), 1);
}

#[tokio::test]
async fn restarted_cluster_is_unsealed_again() {
    let fixture = Fixture::new(3);
    let prompt = Arc::new(ScriptedPrompt::accept(3, 2));
    fixture.orchestrator(prompt.clone()).run().await.unwrap();

    fixture.cluster.seal_all();
    fixture.orchestrator(prompt).run().await.unwrap();

    for node_id in NODE_IDS {
        assert_eq!(fixture.cluster.is_sealed(node_id), Some(false));
    }
    assert_eq!(fixture.cluster.init_calls(), 1);
}

#[tokio::test]
async fn without_unseal_keys_the_admin_login_drives_the_run() {
    let fixture = Fixture::new(3);
    let prompt = Arc::new(ScriptedPrompt::accept(3, 2));
    fixture.orchestrator(prompt.clone()).run().await.unwrap();

    // Unseal keys kept offline: a new store only has what Vault itself holds
    let offline = ClusterStore::new(Arc::new(MemoryStorage::new()));
    let ha = fixture
        .orchestrator_with_store(offline.clone(), prompt)
        .run()
        .await
        .unwrap();

    assert_eq!(fixture.cluster.root_tokens_generated(), 1);
    assert!(offline.unseal_keys().await.unwrap().is_none());
    assert!(offline.backend().read(RAFT_SNAPSHOT_KEY, false).await.unwrap().is_some());

    let token = ha.api().token().unwrap();
    assert_ne!(token, Secret::new(ADMIN_PASSWORD));
    assert!(ha.api().is_authenticated().await.unwrap());
}

#[tokio::test]
async fn declining_initialization_exits_safely() {
    let fixture = Fixture::new(3);
    let err = fixture
        .orchestrator(Arc::new(ScriptedPrompt::decline()))
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SafeExit);
    assert_eq!(fixture.cluster.init_calls(), 0);
    assert!(!fixture.storage.contains(UNSEAL_KEYS_KEY));
}

#[tokio::test]
async fn persistent_quorum_loss_exhausts_the_retry_budget() {
    let fixture = Fixture::new(3);
    fixture.cluster.set_lost_quorum(true);

    let err = fixture
        .orchestrator(Arc::new(ScriptedPrompt::accept(3, 2)))
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Fatal);
    match err {
        VaultsmithError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*last, VaultsmithError::QuorumLost { .. }));
        }
        other => panic!("unexpected error: {}", other),
    }
    // The first attempt initialized; the second one found it done
    assert_eq!(fixture.cluster.init_calls(), 1);
}

/// Operator who hits ctrl-c at the confirmation question
#[derive(Default)]
struct InterruptingPrompt {
    asked: AtomicUsize,
}

#[async_trait]
impl OperatorPrompt for InterruptingPrompt {
    async fn confirm_initialize(&self) -> VaultsmithResult<bool> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Err(VaultsmithError::Interrupted)
    }

    async fn key_shares_and_threshold(&self) -> VaultsmithResult<(u32, u32)> {
        panic!("key split asked after an interrupt");
    }
}

#[tokio::test]
async fn interrupt_at_the_prompt_stops_without_retrying() {
    let fixture = Fixture::new(3);
    let prompt = Arc::new(InterruptingPrompt::default());

    let err = fixture.orchestrator(prompt.clone()).run().await.unwrap_err();

    assert!(matches!(err, VaultsmithError::Interrupted), "{}", err);
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.cluster.init_calls(), 0);
    assert!(!fixture.storage.contains(UNSEAL_KEYS_KEY));
}

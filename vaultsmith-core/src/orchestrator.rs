//! Bootstrap pipeline driver
//!
//! [`ClusterOrchestrator::run_once`] walks the cluster from whatever state it
//! is in to fully configured. Each call rebuilds every client from scratch,
//! so [`ClusterOrchestrator::run`] can simply call it again after a
//! retryable failure.
//!
//! ```text
//! prepare (CA, node clients, HA client)
//!   → initialize → unseal → ready node → root token → raft
//!   → admin user* → root PKI → infra apply → revoke → external secrets
//!   → snapshot
//! * only while unseal keys are stored
//! ```

use crate::config::{ClusterConfig, VaultConfig};
use crate::error::{VaultsmithError, VaultsmithResult};
use crate::ha_client::HaClient;
use crate::node_client::NodeClient;
use crate::patterns::{retry, RetryConfig};
use crate::pki::{write_public_file, CertificateAuthority};
use crate::prompt::OperatorPrompt;
use crate::steps::{
    admin_user::configure_admin_user,
    infra::{apply_infrastructure, InfraApplier},
    initialize::initialize_cluster,
    pki_root::configure_root_pki,
    raft_membership::reconcile_raft,
    ready_node::find_ready_node,
    revoke::revoke_transient_credentials,
    root_token::{broadcast_token, generate_root_token},
    secrets_sync::sync_external_services,
    snapshot::take_snapshot,
    unseal::unseal_nodes,
};
use crate::storage::ClusterStore;
use crate::topology::{self, Topology};
use crate::vault_api::{VaultApi, VaultApiFactory};
use std::sync::Arc;
use tracing::{info, warn};

pub const ROOT_CA_CERT_FILE: &str = "vault_root_ca_cert.pem";

/// Everything built before the first Vault call of a run
pub struct ClusterClients {
    pub vault_config: VaultConfig,
    pub topology: Topology,
    pub ca: CertificateAuthority,
    pub root_ca_pem: String,
    pub nodes: Vec<NodeClient>,
    pub ha: HaClient,
}

pub struct ClusterOrchestrator {
    config: ClusterConfig,
    store: ClusterStore,
    api_factory: Arc<dyn VaultApiFactory>,
    prompt: Arc<dyn OperatorPrompt>,
    infra: Arc<dyn InfraApplier>,
}

impl ClusterOrchestrator {
    pub fn new(
        config: ClusterConfig,
        store: ClusterStore,
        api_factory: Arc<dyn VaultApiFactory>,
        prompt: Arc<dyn OperatorPrompt>,
        infra: Arc<dyn InfraApplier>,
    ) -> Self {
        Self {
            config,
            store,
            api_factory,
            prompt,
            infra,
        }
    }

    /// Connect the configured storage backend and build an orchestrator over it
    pub async fn connect(
        config: ClusterConfig,
        api_factory: Arc<dyn VaultApiFactory>,
        prompt: Arc<dyn OperatorPrompt>,
        infra: Arc<dyn InfraApplier>,
    ) -> VaultsmithResult<Self> {
        let backend = config.storage.connect().await?;
        info!("Using storage backend {}", backend.describe());
        Ok(Self::new(config, ClusterStore::new(backend), api_factory, prompt, infra))
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    /// Inline `vault_config`, or the copy kept in storage
    pub async fn vault_config(&self) -> VaultsmithResult<VaultConfig> {
        match &self.config.vault_config {
            Some(inline) => Ok(inline.clone()),
            None => self.store.load_vault_config().await,
        }
    }

    /// Resolve the topology using the configured scratch directory
    pub async fn topology(&self) -> VaultsmithResult<Topology> {
        let vault_config = self.vault_config().await?;
        topology::resolve(
            &vault_config.vault_servers,
            &vault_config.vault_secrets.vault_ha_hostname,
            &self.config.tmp_dir_path,
        )
    }

    /// Load the root CA and issue fresh client credentials for every node and the HA endpoint
    pub async fn prepare(&self) -> VaultsmithResult<ClusterClients> {
        let vault_config = self.vault_config().await?;
        vault_config.validate()?;
        let secrets = &vault_config.vault_secrets;
        let topology = topology::resolve(
            &vault_config.vault_servers,
            &secrets.vault_ha_hostname,
            &self.config.tmp_dir_path,
        )?;
        info!("Resolved {} Vault nodes", topology.len());

        let pki = &secrets.root_pki_details;
        let password = (!pki.root_ca_key_password.is_empty()).then_some(&pki.root_ca_key_password);
        let ca = CertificateAuthority::from_pem(&pki.root_ca_cert_pem, &pki.root_ca_key_pem, password)?;
        let root_ca_pem = ca.certificate_pem()?;
        write_public_file(
            &self.config.tmp_dir_path.join(ROOT_CA_CERT_FILE),
            root_ca_pem.as_bytes(),
        )
        .await?;

        let nodes = NodeClient::materialize_all(topology.nodes(), &ca, self.api_factory.as_ref()).await?;
        let ha = HaClient::build(
            &topology,
            secrets,
            &ca,
            &self.config.tmp_dir_path,
            self.api_factory.as_ref(),
        )
        .await?;

        Ok(ClusterClients {
            vault_config,
            topology,
            ca,
            root_ca_pem,
            nodes,
            ha,
        })
    }

    /// One pass over the whole pipeline
    pub async fn run_once(&self) -> VaultsmithResult<HaClient> {
        let clients = self.prepare().await?;
        let ClusterClients {
            vault_config,
            topology,
            ca,
            root_ca_pem,
            nodes,
            ha,
        } = clients;
        let secrets = &vault_config.vault_secrets;

        initialize_cluster(&nodes, &self.store, self.prompt.as_ref()).await?;
        unseal_nodes(&nodes, &self.store).await?;
        let ready = find_ready_node(&nodes).await?;

        let unseal_bundle = self.store.unseal_keys().await?;
        let token = match &unseal_bundle {
            Some(bundle) => generate_root_token(ready, bundle).await?,
            None => {
                info!("No unseal keys stored, using the HA client's session");
                ha.ensure_authenticated().await?;
                ha.api().token().ok_or_else(|| VaultsmithError::Unauthenticated {
                    endpoint: ha.api().address().to_string(),
                })?
            }
        };
        broadcast_token(&nodes, &token).await?;

        reconcile_raft(ready, &nodes, &topology, &root_ca_pem).await?;

        if unseal_bundle.is_some() {
            configure_admin_user(ready.api(), &secrets.vault_admin_userpass_details).await?;
        } else {
            info!("Skipping admin user setup: no unseal keys stored");
        }

        ha.ensure_authenticated().await?;
        configure_root_pki(ha.api(), &ca).await?;

        ha.ensure_authenticated().await?;
        apply_infrastructure(
            self.config.terraform_dir.as_deref(),
            &self.config.tmp_dir_path,
            &self.store,
            &ha,
            self.infra.as_ref(),
        )
        .await?;

        let revoker: &dyn VaultApi = if unseal_bundle.is_some() {
            ready.api()
        } else {
            ha.ensure_authenticated().await?;
            ha.api()
        };
        revoke_transient_credentials(revoker).await?;

        ha.ensure_authenticated().await?;
        sync_external_services(ha.api(), &secrets.external_services).await?;

        ha.ensure_authenticated().await?;
        take_snapshot(ha.api(), &self.store).await?;

        info!("Vault cluster bootstrap complete");
        Ok(ha)
    }

    /// Run the pipeline until it succeeds, fails fatally, or the attempt budget is spent
    pub async fn run(&self) -> VaultsmithResult<HaClient> {
        let settings = &self.config.orchestration;
        let config = RetryConfig::for_orchestration(settings.attempts, settings.retry_wait);
        retry(&config, || self.run_once()).await
    }

    /// Build the HA client and store a Raft snapshot, nothing else
    pub async fn snapshot(&self) -> VaultsmithResult<usize> {
        let clients = self.prepare().await?;
        clients.ha.ensure_authenticated().await.map_err(|e| {
            warn!("HA client cannot authenticate: {}", e);
            e
        })?;
        take_snapshot(clients.ha.api(), &self.store).await
    }
}

impl std::fmt::Debug for ClusterOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterOrchestrator")
            .field("tmp_dir", &self.config.tmp_dir_path)
            .field("storage", &self.store.backend().describe())
            .finish_non_exhaustive()
    }
}

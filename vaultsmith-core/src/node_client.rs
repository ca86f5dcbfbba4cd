//! Per-node Vault clients
//!
//! Every resolved node gets its own client identity: a fresh RSA key and a
//! short-lived client-auth certificate signed by the root CA, written to the
//! node's scratch directory. The resulting [`NodeClient`] owns an API session
//! bound to the node's API address.

use crate::error::VaultsmithResult;
use crate::pki::{
    ensure_certificate_content, ensure_private_key_content, write_private_file, write_public_file,
    CertificateAuthority, CertificateProperties, DEFAULT_KEY_SIZE, DEFAULT_PUBLIC_EXPONENT,
};
use crate::topology::RaftNode;
use crate::types::Secret;
use crate::vault_api::{VaultApi, VaultApiFactory, VaultEndpoint};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Validity of node and HA client certificates
pub const CLIENT_CERT_DAYS: u32 = 90;

pub const CLIENT_KEY_FILE: &str = "vault-client-priv.key";
pub const CLIENT_CERT_FILE: &str = "vault-client-cert.pem";

/// A resolved node plus an authenticated-capable session to it
pub struct NodeClient {
    node: RaftNode,
    api: Arc<dyn VaultApi>,
    client_cert_pem: String,
    client_key_pem: Secret,
    key_path: PathBuf,
    cert_path: PathBuf,
}

impl std::fmt::Debug for NodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClient")
            .field("node_id", &self.node.node_id)
            .field("api_addr", &self.node.api_addr)
            .finish_non_exhaustive()
    }
}

impl NodeClient {
    /// Issue credentials for `node` and connect to its API address
    pub async fn materialize(
        node: &RaftNode,
        ca: &CertificateAuthority,
        factory: &dyn VaultApiFactory,
    ) -> VaultsmithResult<Self> {
        let key = ensure_private_key_content(None, None, DEFAULT_KEY_SIZE, DEFAULT_PUBLIC_EXPONENT)?;
        let properties = CertificateProperties::client_auth(
            node.node_id.clone(),
            node.subject_alt_names.clone(),
            CLIENT_CERT_DAYS,
        );
        let certificate = ensure_certificate_content(&key.key, &properties, None, Some(ca))?;

        let key_path = node.scratch_dir.join(CLIENT_KEY_FILE);
        let cert_path = node.scratch_dir.join(CLIENT_CERT_FILE);
        write_private_file(&key_path, key.pem.expose().as_bytes()).await?;
        write_public_file(&cert_path, certificate.full_chain_pem.as_bytes()).await?;
        debug!("Wrote client credentials for {} to {}", node.node_id, node.scratch_dir.display());

        let api = factory.connect(&VaultEndpoint {
            url: node.api_addr.clone(),
            ca_cert_pem: ca.certificate_pem()?,
            client_cert_pem: certificate.full_chain_pem.clone(),
            client_key_pem: key.pem.clone(),
        })?;
        info!("Created Vault client for {} at {}", node.node_id, node.api_addr);

        Ok(Self {
            node: node.clone(),
            api,
            client_cert_pem: certificate.full_chain_pem,
            client_key_pem: key.pem,
            key_path,
            cert_path,
        })
    }

    /// Build clients for every node, in topology order
    pub async fn materialize_all<'a>(
        nodes: impl IntoIterator<Item = &'a RaftNode>,
        ca: &CertificateAuthority,
        factory: &dyn VaultApiFactory,
    ) -> VaultsmithResult<Vec<Self>> {
        let mut clients = Vec::new();
        for node in nodes {
            clients.push(Self::materialize(node, ca, factory).await?);
        }
        Ok(clients)
    }

    pub fn node(&self) -> &RaftNode {
        &self.node
    }

    pub fn node_id(&self) -> &str {
        &self.node.node_id
    }

    pub fn api(&self) -> &dyn VaultApi {
        self.api.as_ref()
    }

    /// Client certificate chain this node's session presents
    pub fn client_cert_pem(&self) -> &str {
        &self.client_cert_pem
    }

    pub fn client_key_pem(&self) -> &Secret {
        &self.client_key_pem
    }

    pub fn key_path(&self) -> &PathBuf {
        &self.key_path
    }

    pub fn cert_path(&self) -> &PathBuf {
        &self.cert_path
    }
}

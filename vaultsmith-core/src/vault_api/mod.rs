//! Typed access to a Vault node's HTTP API
//!
//! [`VaultApi`] is the seam between orchestration logic and the network.
//! [`HttpVaultApi`] talks to a real node over mutual TLS;
//! [`MockVaultCluster`] simulates a whole Raft cluster in process so the
//! orchestration steps can be exercised without Vault binaries.
//!
//! Every client carries its own session token. Setting the token on one
//! client never affects another.

pub mod http;
pub mod mock;
pub mod types;

pub use http::{HttpVaultApi, HttpVaultApiFactory};
pub use mock::{MockVaultCluster, MockVaultNode};
pub use types::{
    serials_match, GenerateRootStatus, HealthStatus, InitRequest, InitResponse, IssuerInfo,
    MountInfo, MountTable, MountTune, RaftJoinRequest, RaftServer, SealStatus, TokenInfo,
    UserpassUser,
};

use crate::error::{VaultsmithError, VaultsmithResult};
use crate::types::Secret;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where and how to reach one Vault API endpoint
#[derive(Clone)]
pub struct VaultEndpoint {
    /// `https://host:port`
    pub url: String,
    /// Sole trust anchor for the server certificate
    pub ca_cert_pem: String,
    /// Client certificate chain presented for mutual TLS
    pub client_cert_pem: String,
    pub client_key_pem: Secret,
}

impl std::fmt::Debug for VaultEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultEndpoint")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// Builds API clients for endpoints
pub trait VaultApiFactory: Send + Sync {
    fn connect(&self, endpoint: &VaultEndpoint) -> VaultsmithResult<Arc<dyn VaultApi>>;
}

/// Operations the orchestrator needs from a Vault node
///
/// Errors returned by Vault itself surface as [`VaultsmithError::VaultApi`]
/// with the HTTP status and Vault's error strings; connection failures are
/// [`VaultsmithError::Transport`] after the per-request retry budget.
#[async_trait]
pub trait VaultApi: Send + Sync {
    /// Base URL this client is bound to
    fn address(&self) -> &str;

    fn token(&self) -> Option<Secret>;

    fn set_token(&self, token: Option<Secret>);

    // sys/health, sys/init, sys/unseal
    async fn health(&self) -> VaultsmithResult<HealthStatus>;
    async fn is_initialized(&self) -> VaultsmithResult<bool>;
    async fn initialize(&self, request: &InitRequest) -> VaultsmithResult<InitResponse>;
    async fn unseal(&self, key: &Secret) -> VaultsmithResult<SealStatus>;

    // sys/generate-root
    async fn generate_root_status(&self) -> VaultsmithResult<GenerateRootStatus>;
    async fn generate_root_start(&self) -> VaultsmithResult<GenerateRootStatus>;
    async fn generate_root_cancel(&self) -> VaultsmithResult<()>;
    async fn generate_root_update(&self, key: &Secret, nonce: &str) -> VaultsmithResult<GenerateRootStatus>;

    // sys/storage/raft
    async fn raft_configuration(&self) -> VaultsmithResult<Vec<RaftServer>>;
    async fn raft_join(&self, request: &RaftJoinRequest) -> VaultsmithResult<bool>;
    async fn raft_remove_peer(&self, node_id: &str) -> VaultsmithResult<()>;
    async fn raft_snapshot(&self) -> VaultsmithResult<Vec<u8>>;

    // auth/token
    async fn lookup_self(&self) -> VaultsmithResult<TokenInfo>;
    async fn list_token_accessors(&self) -> VaultsmithResult<Vec<String>>;
    async fn lookup_accessor(&self, accessor: &str) -> VaultsmithResult<TokenInfo>;
    async fn revoke_accessor(&self, accessor: &str) -> VaultsmithResult<()>;
    async fn revoke_self(&self) -> VaultsmithResult<()>;

    /// Log in through a userpass mount and adopt the issued token
    async fn userpass_login(&self, mount: &str, username: &str, password: &Secret) -> VaultsmithResult<Secret>;

    // policies and auth methods
    async fn put_policy(&self, name: &str, policy: &str) -> VaultsmithResult<()>;
    async fn list_auth_methods(&self) -> VaultsmithResult<MountTable>;
    async fn enable_auth_method(&self, path: &str, kind: &str) -> VaultsmithResult<()>;
    async fn tune_auth_method(&self, path: &str, tune: &MountTune) -> VaultsmithResult<()>;
    async fn write_userpass_user(&self, mount: &str, username: &str, user: &UserpassUser) -> VaultsmithResult<()>;
    async fn list_approle_roles(&self, mount: &str) -> VaultsmithResult<Vec<String>>;
    async fn list_secret_id_accessors(&self, mount: &str, role: &str) -> VaultsmithResult<Vec<String>>;
    async fn destroy_secret_id_accessor(&self, mount: &str, role: &str, accessor: &str) -> VaultsmithResult<()>;

    // secrets engines
    async fn list_mounts(&self) -> VaultsmithResult<MountTable>;
    async fn enable_secrets_engine(&self, path: &str, kind: &str, tune: &MountTune) -> VaultsmithResult<()>;
    async fn tune_mount(&self, path: &str, tune: &MountTune) -> VaultsmithResult<()>;

    // pki
    async fn pki_submit_ca(&self, mount: &str, pem_bundle: &Secret) -> VaultsmithResult<()>;
    async fn pki_list_issuers(&self, mount: &str) -> VaultsmithResult<BTreeMap<String, IssuerInfo>>;
    async fn pki_set_default_issuer(&self, mount: &str, issuer_ref: &str) -> VaultsmithResult<()>;
    async fn pki_delete_issuer(&self, mount: &str, issuer_ref: &str) -> VaultsmithResult<()>;
    async fn pki_name_issuer(&self, mount: &str, issuer_ref: &str, name: &str) -> VaultsmithResult<()>;

    // kv v2
    async fn kv2_write(&self, mount: &str, path: &str, data: &Map<String, Value>) -> VaultsmithResult<()>;
    /// Child keys under a metadata path; directories end in `/`. Missing paths list as empty.
    async fn kv2_list(&self, mount: &str, path: &str) -> VaultsmithResult<Vec<String>>;
    async fn kv2_delete_metadata(&self, mount: &str, path: &str) -> VaultsmithResult<()>;

    /// Whether the current token is accepted
    async fn is_authenticated(&self) -> VaultsmithResult<bool> {
        if self.token().is_none() {
            return Ok(false);
        }
        match self.lookup_self().await {
            Ok(_) => Ok(true),
            Err(VaultsmithError::VaultApi { status: 403, .. })
            | Err(VaultsmithError::Unauthenticated { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Vault API error from a status code and the `errors` array of a response body
pub fn api_error(endpoint: &str, status: u16, body: &str) -> VaultsmithError {
    let errors = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("errors").cloned())
        .and_then(|errors| serde_json::from_value::<Vec<String>>(errors).ok())
        .unwrap_or_else(|| {
            if body.trim().is_empty() {
                Vec::new()
            } else {
                vec![body.trim().to_string()]
            }
        });
    VaultsmithError::VaultApi {
        endpoint: endpoint.to_string(),
        status,
        errors,
    }
}

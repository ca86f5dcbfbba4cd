//! In-process simulation of a Vault Raft cluster
//!
//! The simulation keeps one shared state for the cluster and one session
//! token per client. It models what the bootstrap pipeline depends on:
//! Shamir-style unsealing with a key threshold, root token generation with
//! OTP masking, Raft membership with a leader, token accessors, userpass and
//! AppRole auth mounts, PKI issuers and KV v2 secrets.
//!
//! Simplifications: every registered node reports `initialized` once the
//! cluster is, and Raft membership only changes through explicit join and
//! remove calls. Policies are stored but not enforced; any live token is
//! accepted on authenticated endpoints.

use super::types::{
    serials_match, GenerateRootStatus, HealthStatus, InitRequest, InitResponse, IssuerInfo, MountInfo, MountTable,
    MountTune, RaftJoinRequest, RaftServer, SealStatus, TokenInfo, UserpassUser,
};
use super::{VaultApi, VaultApiFactory, VaultEndpoint};
use crate::error::{VaultsmithError, VaultsmithResult};
use crate::topology::Topology;
use crate::types::Secret;
use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD as BASE64, STANDARD_NO_PAD as BASE64_NO_PAD};
use base64::Engine as _;
use openssl::x509::X509;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;

const ROOT_TOKEN_LENGTH: usize = 28;
const LOST_QUORUM_MESSAGE: &str = "local node not active but active cluster node not found";

fn api_error(endpoint: &str, status: u16, message: impl Into<String>) -> VaultsmithError {
    VaultsmithError::VaultApi {
        endpoint: endpoint.to_string(),
        status,
        errors: vec![message.into()],
    }
}

#[derive(Debug, Clone)]
struct TokenEntry {
    accessor: String,
    display_name: String,
    policies: Vec<String>,
    creation_time: i64,
}

impl TokenEntry {
    fn new(accessor: String, display_name: &str, policies: Vec<String>) -> Self {
        Self {
            accessor,
            display_name: display_name.to_string(),
            policies,
            creation_time: chrono::Utc::now().timestamp(),
        }
    }

    fn info(&self) -> TokenInfo {
        TokenInfo {
            accessor: self.accessor.clone(),
            display_name: self.display_name.clone(),
            policies: self.policies.clone(),
            creation_time: self.creation_time,
            expire_time: None,
        }
    }
}

#[derive(Debug)]
struct NodeState {
    node_id: String,
    raft_address: String,
    sealed: bool,
    unseal_progress: BTreeSet<Vec<u8>>,
}

#[derive(Debug)]
struct RootAttempt {
    nonce: String,
    otp: String,
    progress: BTreeSet<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct UserEntry {
    password: String,
    policies: Vec<String>,
}

#[derive(Debug, Default)]
struct ClusterState {
    /// API address → node
    nodes: BTreeMap<String, NodeState>,
    ha_address: Option<String>,
    initialized: bool,
    shares: Vec<Vec<u8>>,
    threshold: u32,
    tokens: BTreeMap<String, TokenEntry>,
    raft_members: Vec<(String, String)>,
    leader: Option<String>,
    root_attempt: Option<RootAttempt>,
    lost_quorum: bool,
    policies: BTreeMap<String, String>,
    auth_mounts: MountTable,
    auth_tunes: BTreeMap<String, MountTune>,
    users: BTreeMap<(String, String), UserEntry>,
    approles: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    mounts: MountTable,
    mount_tunes: BTreeMap<String, MountTune>,
    issuers: BTreeMap<String, BTreeMap<String, IssuerInfo>>,
    default_issuer: BTreeMap<String, String>,
    kv: BTreeMap<String, Map<String, Value>>,
    init_calls: usize,
    join_calls: usize,
    remove_calls: usize,
    snapshot_calls: usize,
    root_tokens_generated: usize,
    counter: u64,
}

impl ClusterState {
    fn new() -> Self {
        let mut state = Self::default();
        state.auth_mounts.insert(
            "token/".to_string(),
            MountInfo {
                kind: "token".to_string(),
                description: "token based credentials".to_string(),
            },
        );
        for (path, kind) in [("sys/", "system"), ("cubbyhole/", "cubbyhole"), ("identity/", "identity")] {
            state.mounts.insert(
                path.to_string(),
                MountInfo {
                    kind: kind.to_string(),
                    description: String::new(),
                },
            );
        }
        state
    }

    /// Unique, reproducible bytes; shares, tokens and IDs only need to be distinct
    fn next_bytes(&mut self, len: usize) -> Vec<u8> {
        self.counter += 1;
        let digest = Sha256::digest(format!("mock-vault-{}", self.counter).as_bytes());
        digest.iter().cycle().take(len).copied().collect()
    }

    fn next_hex(&mut self, len: usize) -> String {
        hex::encode(self.next_bytes(len))
    }

    fn leader_address(&self) -> Option<String> {
        let leader = self.leader.as_ref()?;
        self.nodes
            .iter()
            .find(|(_, node)| &node.node_id == leader)
            .map(|(address, _)| address.clone())
    }

    fn node_id_of(&self, address: &str) -> Option<String> {
        self.nodes.get(address).map(|node| node.node_id.clone())
    }

    fn is_member(&self, node_id: &str) -> bool {
        self.raft_members.iter().any(|(id, _)| id == node_id)
    }

    fn valid_share(&self, key: &Secret) -> Option<Vec<u8>> {
        let bytes = hex::decode(key.expose())
            .ok()
            .or_else(|| BASE64.decode(key.expose()).ok())?;
        self.shares.contains(&bytes).then_some(bytes)
    }

    fn issue_token(&mut self, display_name: &str, policies: Vec<String>) -> String {
        let token = format!("hvs.{}", self.next_hex(12));
        let accessor = self.next_hex(12);
        self.tokens
            .insert(token.clone(), TokenEntry::new(accessor, display_name, policies));
        token
    }

    fn token_by_accessor(&self, accessor: &str) -> Option<String> {
        self.tokens
            .iter()
            .find(|(_, entry)| entry.accessor == accessor)
            .map(|(token, _)| token.clone())
    }
}

/// A simulated Raft cluster; hands out [`MockVaultNode`] clients
#[derive(Clone)]
pub struct MockVaultCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl Default for MockVaultCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVaultCluster {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState::new())),
        }
    }

    /// Register a node reachable at `api_addr` advertising `raft_address` (`host:port`)
    pub fn add_node(&self, node_id: &str, api_addr: &str, raft_address: &str) -> &Self {
        self.state.lock().nodes.insert(
            api_addr.trim_end_matches('/').to_string(),
            NodeState {
                node_id: node_id.to_string(),
                raft_address: raft_address.to_string(),
                sealed: true,
                unseal_progress: BTreeSet::new(),
            },
        );
        self
    }

    /// Register every node of a resolved topology
    pub fn from_topology(topology: &Topology, ha_url: &str) -> Self {
        let cluster = Self::new();
        for node in topology.nodes() {
            cluster.add_node(&node.node_id, &node.api_addr, &node.raft_address());
        }
        cluster.set_ha_address(ha_url);
        cluster
    }

    /// Requests to this address are served by the current leader
    pub fn set_ha_address(&self, url: &str) -> &Self {
        self.state.lock().ha_address = Some(url.trim_end_matches('/').to_string());
        self
    }

    pub fn client(&self, address: &str) -> MockVaultNode {
        MockVaultNode {
            state: Arc::clone(&self.state),
            address: address.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        }
    }

    /// Make root generation fail the way a cluster without quorum does
    pub fn set_lost_quorum(&self, lost: bool) {
        self.state.lock().lost_quorum = lost;
    }

    /// Seal every node, as after a restart
    pub fn seal_all(&self) {
        for node in self.state.lock().nodes.values_mut() {
            node.sealed = true;
            node.unseal_progress.clear();
        }
    }

    /// Add a Raft member that is not a registered node
    pub fn add_foreign_raft_member(&self, node_id: &str, raft_address: &str) {
        self.state
            .lock()
            .raft_members
            .push((node_id.to_string(), raft_address.to_string()));
    }

    /// Create an AppRole mount with one role and the given secret-ID accessors
    pub fn seed_approle(&self, mount: &str, role: &str, accessors: &[&str]) {
        let mut state = self.state.lock();
        state.auth_mounts.insert(
            format!("{}/", mount),
            MountInfo {
                kind: "approle".to_string(),
                description: String::new(),
            },
        );
        state
            .approles
            .entry(mount.to_string())
            .or_default()
            .insert(role.to_string(), accessors.iter().map(|a| a.to_string()).collect());
    }

    /// Issue an extra token, returning its accessor
    pub fn seed_token(&self, display_name: &str) -> String {
        let mut state = self.state.lock();
        let token = state.issue_token(display_name, vec!["default".to_string()]);
        state.tokens[&token].accessor.clone()
    }

    pub fn seed_kv(&self, mount: &str, path: &str, data: Map<String, Value>) {
        self.state.lock().kv.insert(format!("{}/{}", mount, path), data);
    }

    pub fn init_calls(&self) -> usize {
        self.state.lock().init_calls
    }

    pub fn join_calls(&self) -> usize {
        self.state.lock().join_calls
    }

    pub fn remove_calls(&self) -> usize {
        self.state.lock().remove_calls
    }

    pub fn snapshot_calls(&self) -> usize {
        self.state.lock().snapshot_calls
    }

    pub fn root_tokens_generated(&self) -> usize {
        self.state.lock().root_tokens_generated
    }

    pub fn raft_members(&self) -> Vec<String> {
        self.state
            .lock()
            .raft_members
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn leader(&self) -> Option<String> {
        self.state.lock().leader.clone()
    }

    pub fn is_sealed(&self, node_id: &str) -> Option<bool> {
        self.state
            .lock()
            .nodes
            .values()
            .find(|node| node.node_id == node_id)
            .map(|node| node.sealed)
    }

    pub fn token_count(&self) -> usize {
        self.state.lock().tokens.len()
    }

    pub fn policy(&self, name: &str) -> Option<String> {
        self.state.lock().policies.get(name).cloned()
    }

    pub fn user_policies(&self, mount: &str, username: &str) -> Option<Vec<String>> {
        self.state
            .lock()
            .users
            .get(&(mount.to_string(), username.to_string()))
            .map(|user| user.policies.clone())
    }

    pub fn auth_tune(&self, path: &str) -> Option<MountTune> {
        self.state.lock().auth_tunes.get(path).cloned()
    }

    pub fn mount_tune(&self, path: &str) -> Option<MountTune> {
        self.state.lock().mount_tunes.get(path).cloned()
    }

    pub fn issuers(&self, mount: &str) -> BTreeMap<String, IssuerInfo> {
        self.state.lock().issuers.get(mount).cloned().unwrap_or_default()
    }

    pub fn default_issuer(&self, mount: &str) -> Option<String> {
        self.state.lock().default_issuer.get(mount).cloned()
    }

    /// Add an issuer that did not come from a submitted bundle
    pub fn seed_issuer(&self, mount: &str, serial_number: &str) -> String {
        let mut state = self.state.lock();
        let id = state.next_hex(16);
        state.issuers.entry(mount.to_string()).or_default().insert(
            id.clone(),
            IssuerInfo {
                issuer_name: String::new(),
                serial_number: serial_number.to_string(),
            },
        );
        id
    }

    pub fn secret_id_accessors(&self, mount: &str, role: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .approles
            .get(mount)
            .and_then(|roles| roles.get(role))
            .cloned()
            .unwrap_or_default()
    }

    pub fn kv_secret(&self, mount: &str, path: &str) -> Option<Map<String, Value>> {
        self.state.lock().kv.get(&format!("{}/{}", mount, path)).cloned()
    }

    pub fn kv_paths(&self, mount: &str) -> Vec<String> {
        let prefix = format!("{}/", mount);
        self.state
            .lock()
            .kv
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }
}

impl VaultApiFactory for MockVaultCluster {
    fn connect(&self, endpoint: &VaultEndpoint) -> VaultsmithResult<Arc<dyn VaultApi>> {
        let address = endpoint.url.trim_end_matches('/');
        let known = {
            let state = self.state.lock();
            state.nodes.contains_key(address) || state.ha_address.as_deref() == Some(address)
        };
        if !known {
            return Err(VaultsmithError::internal(format!(
                "no simulated Vault node at {}",
                endpoint.url
            )));
        }
        Ok(Arc::new(self.client(address)))
    }
}

/// Client session against a [`MockVaultCluster`]
pub struct MockVaultNode {
    state: Arc<Mutex<ClusterState>>,
    address: String,
    token: RwLock<Option<Secret>>,
}

impl MockVaultNode {
    /// Node address serving this client, resolving the HA address to the leader
    fn serving_address(&self, state: &ClusterState, endpoint: &str) -> VaultsmithResult<String> {
        if state.ha_address.as_deref() == Some(self.address.as_str()) {
            return state
                .leader_address()
                .ok_or_else(|| api_error(endpoint, 503, "no active node"));
        }
        Ok(self.address.clone())
    }

    /// Require an unsealed serving node and a live token
    fn authorize(&self, state: &ClusterState, endpoint: &str) -> VaultsmithResult<TokenEntry> {
        let address = self.serving_address(state, endpoint)?;
        let sealed = state.nodes.get(&address).map_or(true, |node| node.sealed);
        if sealed {
            return Err(api_error(endpoint, 503, "Vault is sealed"));
        }
        let token = self
            .token()
            .ok_or_else(|| api_error(endpoint, 403, "permission denied"))?;
        state
            .tokens
            .get(token.expose())
            .cloned()
            .ok_or_else(|| api_error(endpoint, 403, "permission denied"))
    }

    fn require_unsealed(&self, state: &ClusterState, endpoint: &str) -> VaultsmithResult<String> {
        let address = self.serving_address(state, endpoint)?;
        match state.nodes.get(&address) {
            Some(node) if !node.sealed => Ok(address),
            _ => Err(api_error(endpoint, 503, "Vault is sealed")),
        }
    }
}

#[async_trait]
impl VaultApi for MockVaultNode {
    fn address(&self) -> &str {
        &self.address
    }

    fn token(&self) -> Option<Secret> {
        self.token.read().clone()
    }

    fn set_token(&self, token: Option<Secret>) {
        *self.token.write() = token;
    }

    async fn health(&self) -> VaultsmithResult<HealthStatus> {
        let state = self.state.lock();
        let address = self.serving_address(&state, "sys/health")?;
        let node = state
            .nodes
            .get(&address)
            .ok_or_else(|| api_error("sys/health", 502, "unknown node"))?;
        let standby = state.leader.as_deref() != Some(node.node_id.as_str());
        let status_code = if !state.initialized {
            501
        } else if node.sealed {
            503
        } else if standby {
            429
        } else {
            200
        };
        Ok(HealthStatus {
            initialized: state.initialized,
            sealed: node.sealed,
            standby,
            status_code,
        })
    }

    async fn is_initialized(&self) -> VaultsmithResult<bool> {
        Ok(self.state.lock().initialized)
    }

    async fn initialize(&self, request: &InitRequest) -> VaultsmithResult<InitResponse> {
        let mut state = self.state.lock();
        let endpoint = "sys/init";
        state.init_calls += 1;
        if state.initialized {
            return Err(api_error(endpoint, 400, "Vault is already initialized"));
        }
        if request.secret_shares == 0
            || request.secret_threshold == 0
            || request.secret_threshold > request.secret_shares
        {
            return Err(api_error(endpoint, 400, "invalid seal configuration"));
        }
        let node_id = state
            .node_id_of(&self.address)
            .ok_or_else(|| api_error(endpoint, 400, "cannot initialize through the HA address"))?;
        let raft_address = state.nodes[&self.address].raft_address.clone();

        let shares: Vec<Vec<u8>> = (0..request.secret_shares).map(|_| state.next_bytes(32)).collect();
        state.shares = shares;
        state.threshold = request.secret_threshold;
        state.initialized = true;
        state.raft_members = vec![(node_id.clone(), raft_address)];
        state.leader = Some(node_id.clone());
        let root_token = state.issue_token("root", vec!["root".to_string()]);
        info!("Mock: initialized cluster on {}", node_id);

        Ok(InitResponse {
            keys: state.shares.iter().map(|s| Secret::new(hex::encode(s))).collect(),
            keys_base64: state.shares.iter().map(|s| Secret::new(BASE64.encode(s))).collect(),
            root_token: Secret::new(root_token),
        })
    }

    async fn unseal(&self, key: &Secret) -> VaultsmithResult<SealStatus> {
        let mut state = self.state.lock();
        let endpoint = "sys/unseal";
        if !state.initialized {
            return Err(api_error(endpoint, 400, "Vault is not initialized"));
        }
        let share = state
            .valid_share(key)
            .ok_or_else(|| api_error(endpoint, 400, "invalid key"))?;
        let threshold = state.threshold;
        let shares = state.shares.len() as u32;
        let node = state
            .nodes
            .get_mut(&self.address)
            .ok_or_else(|| api_error(endpoint, 400, "cannot unseal through the HA address"))?;

        if node.sealed {
            node.unseal_progress.insert(share);
            if node.unseal_progress.len() as u32 >= threshold {
                node.sealed = false;
                node.unseal_progress.clear();
            }
        }

        Ok(SealStatus {
            sealed: node.sealed,
            threshold,
            shares,
            progress: node.unseal_progress.len() as u32,
        })
    }

    async fn generate_root_status(&self) -> VaultsmithResult<GenerateRootStatus> {
        let state = self.state.lock();
        let endpoint = "sys/generate-root/attempt";
        if state.lost_quorum {
            return Err(api_error(endpoint, 500, LOST_QUORUM_MESSAGE));
        }
        self.require_unsealed(&state, endpoint)?;
        Ok(match &state.root_attempt {
            Some(attempt) => GenerateRootStatus {
                started: true,
                nonce: attempt.nonce.clone(),
                progress: attempt.progress.len() as u32,
                required: state.threshold,
                otp_length: ROOT_TOKEN_LENGTH as u32,
                ..Default::default()
            },
            None => GenerateRootStatus {
                required: state.threshold,
                otp_length: ROOT_TOKEN_LENGTH as u32,
                ..Default::default()
            },
        })
    }

    async fn generate_root_start(&self) -> VaultsmithResult<GenerateRootStatus> {
        let mut state = self.state.lock();
        let endpoint = "sys/generate-root/attempt";
        self.require_unsealed(&state, endpoint)?;
        if state.root_attempt.is_some() {
            return Err(api_error(endpoint, 400, "root generation already in progress"));
        }
        let attempt = RootAttempt {
            nonce: state.next_hex(16),
            otp: state.next_hex(ROOT_TOKEN_LENGTH / 2),
            progress: BTreeSet::new(),
        };
        let status = GenerateRootStatus {
            started: true,
            nonce: attempt.nonce.clone(),
            required: state.threshold,
            otp: Secret::new(attempt.otp.clone()),
            otp_length: ROOT_TOKEN_LENGTH as u32,
            ..Default::default()
        };
        state.root_attempt = Some(attempt);
        Ok(status)
    }

    async fn generate_root_cancel(&self) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        self.require_unsealed(&state, "sys/generate-root/attempt")?;
        state.root_attempt = None;
        Ok(())
    }

    async fn generate_root_update(&self, key: &Secret, nonce: &str) -> VaultsmithResult<GenerateRootStatus> {
        let mut state = self.state.lock();
        let endpoint = "sys/generate-root/update";
        self.require_unsealed(&state, endpoint)?;
        let share = state
            .valid_share(key)
            .ok_or_else(|| api_error(endpoint, 400, "invalid key"))?;
        let threshold = state.threshold;
        let attempt = state
            .root_attempt
            .as_mut()
            .ok_or_else(|| api_error(endpoint, 400, "no root generation in progress"))?;
        if attempt.nonce != nonce {
            return Err(api_error(endpoint, 400, "incorrect nonce"));
        }
        attempt.progress.insert(share);
        let progress = attempt.progress.len() as u32;
        if progress < threshold {
            return Ok(GenerateRootStatus {
                started: true,
                nonce: nonce.to_string(),
                progress,
                required: threshold,
                ..Default::default()
            });
        }

        let otp = attempt.otp.clone();
        state.root_attempt = None;
        let token = state.issue_token("root", vec!["root".to_string()]);
        state.root_tokens_generated += 1;
        let masked: Vec<u8> = token
            .bytes()
            .zip(otp.bytes())
            .map(|(t, o)| t ^ o)
            .collect();

        Ok(GenerateRootStatus {
            started: true,
            nonce: nonce.to_string(),
            progress,
            required: threshold,
            complete: true,
            encoded_token: BASE64_NO_PAD.encode(masked),
            ..Default::default()
        })
    }

    async fn raft_configuration(&self) -> VaultsmithResult<Vec<RaftServer>> {
        let state = self.state.lock();
        self.authorize(&state, "sys/storage/raft/configuration")?;
        Ok(state
            .raft_members
            .iter()
            .map(|(node_id, address)| RaftServer {
                node_id: node_id.clone(),
                address: address.clone(),
                leader: state.leader.as_deref() == Some(node_id.as_str()),
                voter: true,
            })
            .collect())
    }

    async fn raft_join(&self, request: &RaftJoinRequest) -> VaultsmithResult<bool> {
        let mut state = self.state.lock();
        let endpoint = "sys/storage/raft/join";
        state.join_calls += 1;
        let leader_address = state.leader_address();
        if leader_address.as_deref() != Some(request.leader_api_addr.trim_end_matches('/')) {
            return Err(api_error(endpoint, 500, "failed to join raft cluster: leader not reachable"));
        }
        let node = state
            .nodes
            .get(&self.address)
            .ok_or_else(|| api_error(endpoint, 400, "cannot join through the HA address"))?;
        let member = (node.node_id.clone(), node.raft_address.clone());
        if !state.is_member(&member.0) {
            info!("Mock: {} joined raft", member.0);
            state.raft_members.push(member);
        }
        Ok(true)
    }

    async fn raft_remove_peer(&self, node_id: &str) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        self.authorize(&state, "sys/storage/raft/remove-peer")?;
        state.remove_calls += 1;
        state.raft_members.retain(|(id, _)| id != node_id);
        Ok(())
    }

    async fn raft_snapshot(&self) -> VaultsmithResult<Vec<u8>> {
        let mut state = self.state.lock();
        self.authorize(&state, "sys/storage/raft/snapshot")?;
        state.snapshot_calls += 1;
        let members: Vec<&str> = state.raft_members.iter().map(|(id, _)| id.as_str()).collect();
        Ok(format!("raft-snapshot:{}", members.join(",")).into_bytes())
    }

    async fn lookup_self(&self) -> VaultsmithResult<TokenInfo> {
        let state = self.state.lock();
        Ok(self.authorize(&state, "auth/token/lookup-self")?.info())
    }

    async fn list_token_accessors(&self) -> VaultsmithResult<Vec<String>> {
        let state = self.state.lock();
        self.authorize(&state, "auth/token/accessors")?;
        Ok(state.tokens.values().map(|entry| entry.accessor.clone()).collect())
    }

    async fn lookup_accessor(&self, accessor: &str) -> VaultsmithResult<TokenInfo> {
        let state = self.state.lock();
        let endpoint = "auth/token/lookup-accessor";
        self.authorize(&state, endpoint)?;
        state
            .token_by_accessor(accessor)
            .and_then(|token| state.tokens.get(&token))
            .map(TokenEntry::info)
            .ok_or_else(|| api_error(endpoint, 400, "invalid accessor"))
    }

    async fn revoke_accessor(&self, accessor: &str) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        let endpoint = "auth/token/revoke-accessor";
        self.authorize(&state, endpoint)?;
        let token = state
            .token_by_accessor(accessor)
            .ok_or_else(|| api_error(endpoint, 400, "invalid accessor"))?;
        state.tokens.remove(&token);
        Ok(())
    }

    async fn revoke_self(&self) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        self.authorize(&state, "auth/token/revoke-self")?;
        if let Some(token) = self.token() {
            state.tokens.remove(token.expose());
        }
        drop(state);
        self.set_token(None);
        Ok(())
    }

    async fn userpass_login(&self, mount: &str, username: &str, password: &Secret) -> VaultsmithResult<Secret> {
        let mut state = self.state.lock();
        let endpoint = format!("auth/{}/login/{}", mount, username);
        self.require_unsealed(&state, &endpoint)?;
        let user = state
            .users
            .get(&(mount.to_string(), username.to_string()))
            .filter(|user| user.password == password.expose())
            .cloned()
            .ok_or_else(|| api_error(&endpoint, 400, "invalid username or password"))?;
        let token = Secret::new(state.issue_token(&format!("{}-{}", mount, username), user.policies));
        drop(state);
        self.set_token(Some(token.clone()));
        Ok(token)
    }

    async fn put_policy(&self, name: &str, policy: &str) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        self.authorize(&state, "sys/policies/acl")?;
        state.policies.insert(name.to_string(), policy.to_string());
        Ok(())
    }

    async fn list_auth_methods(&self) -> VaultsmithResult<MountTable> {
        let state = self.state.lock();
        self.authorize(&state, "sys/auth")?;
        Ok(state.auth_mounts.clone())
    }

    async fn enable_auth_method(&self, path: &str, kind: &str) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        let endpoint = format!("sys/auth/{}", path);
        self.authorize(&state, &endpoint)?;
        let key = format!("{}/", path);
        if state.auth_mounts.contains_key(&key) {
            return Err(api_error(&endpoint, 400, "path is already in use"));
        }
        state.auth_mounts.insert(
            key,
            MountInfo {
                kind: kind.to_string(),
                description: String::new(),
            },
        );
        Ok(())
    }

    async fn tune_auth_method(&self, path: &str, tune: &MountTune) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        let endpoint = format!("sys/auth/{}/tune", path);
        self.authorize(&state, &endpoint)?;
        if !state.auth_mounts.contains_key(&format!("{}/", path)) {
            return Err(api_error(&endpoint, 400, "no auth method mounted at path"));
        }
        state.auth_tunes.insert(path.to_string(), tune.clone());
        Ok(())
    }

    async fn write_userpass_user(&self, mount: &str, username: &str, user: &UserpassUser) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        let endpoint = format!("auth/{}/users/{}", mount, username);
        self.authorize(&state, &endpoint)?;
        match state.auth_mounts.get(&format!("{}/", mount)) {
            Some(info) if info.kind == "userpass" => {}
            _ => return Err(api_error(&endpoint, 404, "no handler for route")),
        }
        state.users.insert(
            (mount.to_string(), username.to_string()),
            UserEntry {
                password: user.password.expose().to_string(),
                policies: user.token_policies.clone(),
            },
        );
        Ok(())
    }

    async fn list_approle_roles(&self, mount: &str) -> VaultsmithResult<Vec<String>> {
        let state = self.state.lock();
        self.authorize(&state, &format!("auth/{}/role", mount))?;
        Ok(state
            .approles
            .get(mount)
            .map(|roles| roles.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_secret_id_accessors(&self, mount: &str, role: &str) -> VaultsmithResult<Vec<String>> {
        let state = self.state.lock();
        self.authorize(&state, &format!("auth/{}/role/{}/secret-id", mount, role))?;
        Ok(state
            .approles
            .get(mount)
            .and_then(|roles| roles.get(role))
            .map(|accessors| accessors.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn destroy_secret_id_accessor(&self, mount: &str, role: &str, accessor: &str) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        let endpoint = format!("auth/{}/role/{}/secret-id-accessor/destroy", mount, role);
        self.authorize(&state, &endpoint)?;
        let removed = state
            .approles
            .get_mut(mount)
            .and_then(|roles| roles.get_mut(role))
            .map(|accessors| accessors.remove(accessor))
            .unwrap_or(false);
        if !removed {
            return Err(api_error(&endpoint, 400, "failed to find accessor entry"));
        }
        Ok(())
    }

    async fn list_mounts(&self) -> VaultsmithResult<MountTable> {
        let state = self.state.lock();
        self.authorize(&state, "sys/mounts")?;
        Ok(state.mounts.clone())
    }

    async fn enable_secrets_engine(&self, path: &str, kind: &str, tune: &MountTune) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        let endpoint = format!("sys/mounts/{}", path);
        self.authorize(&state, &endpoint)?;
        let key = format!("{}/", path);
        if state.mounts.contains_key(&key) {
            return Err(api_error(&endpoint, 400, "path is already in use"));
        }
        state.mounts.insert(
            key,
            MountInfo {
                kind: kind.to_string(),
                description: String::new(),
            },
        );
        state.mount_tunes.insert(path.to_string(), tune.clone());
        Ok(())
    }

    async fn tune_mount(&self, path: &str, tune: &MountTune) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        let endpoint = format!("sys/mounts/{}/tune", path);
        self.authorize(&state, &endpoint)?;
        if !state.mounts.contains_key(&format!("{}/", path)) {
            return Err(api_error(&endpoint, 400, "no secrets engine mounted at path"));
        }
        state.mount_tunes.insert(path.to_string(), tune.clone());
        Ok(())
    }

    async fn pki_submit_ca(&self, mount: &str, pem_bundle: &Secret) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        let endpoint = format!("{}/config/ca", mount);
        self.authorize(&state, &endpoint)?;
        match state.mounts.get(&format!("{}/", mount)) {
            Some(info) if info.kind == "pki" => {}
            _ => return Err(api_error(&endpoint, 404, "no handler for route")),
        }
        let certificates = X509::stack_from_pem(pem_bundle.expose().as_bytes())
            .map_err(|_| api_error(&endpoint, 400, "no data found in PEM block"))?;
        if certificates.is_empty() {
            return Err(api_error(&endpoint, 400, "no certificates in bundle"));
        }

        for certificate in certificates {
            let serial = certificate
                .serial_number()
                .to_bn()
                .and_then(|bn| bn.to_hex_str().map(|hex| hex.to_string()))
                .map_err(|e| VaultsmithError::crypto("read submitted serial", e))?;
            let serial_number = serial
                .to_lowercase()
                .as_bytes()
                .chunks(2)
                .map(|pair| String::from_utf8_lossy(pair).into_owned())
                .collect::<Vec<_>>()
                .join(":");
            let exists = state.issuers.get(mount).map_or(false, |issuers| {
                issuers
                    .values()
                    .any(|issuer| serials_match(&issuer.serial_number, &serial_number))
            });
            if !exists {
                let id = state.next_hex(16);
                state.issuers.entry(mount.to_string()).or_default().insert(
                    id,
                    IssuerInfo {
                        issuer_name: String::new(),
                        serial_number,
                    },
                );
            }
        }
        Ok(())
    }

    async fn pki_list_issuers(&self, mount: &str) -> VaultsmithResult<BTreeMap<String, IssuerInfo>> {
        let state = self.state.lock();
        self.authorize(&state, &format!("{}/issuers", mount))?;
        Ok(state.issuers.get(mount).cloned().unwrap_or_default())
    }

    async fn pki_set_default_issuer(&self, mount: &str, issuer_ref: &str) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        let endpoint = format!("{}/config/issuers", mount);
        self.authorize(&state, &endpoint)?;
        let exists = state
            .issuers
            .get(mount)
            .map_or(false, |issuers| issuers.contains_key(issuer_ref));
        if !exists {
            return Err(api_error(&endpoint, 400, "unable to resolve issuer"));
        }
        state
            .default_issuer
            .insert(mount.to_string(), issuer_ref.to_string());
        Ok(())
    }

    async fn pki_delete_issuer(&self, mount: &str, issuer_ref: &str) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        self.authorize(&state, &format!("{}/issuer/{}", mount, issuer_ref))?;
        if let Some(issuers) = state.issuers.get_mut(mount) {
            issuers.remove(issuer_ref);
        }
        if state.default_issuer.get(mount).map(String::as_str) == Some(issuer_ref) {
            state.default_issuer.remove(mount);
        }
        Ok(())
    }

    async fn pki_name_issuer(&self, mount: &str, issuer_ref: &str, name: &str) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        let endpoint = format!("{}/issuer/{}", mount, issuer_ref);
        self.authorize(&state, &endpoint)?;
        let issuer = state
            .issuers
            .get_mut(mount)
            .and_then(|issuers| issuers.get_mut(issuer_ref))
            .ok_or_else(|| api_error(&endpoint, 400, "unable to resolve issuer"))?;
        issuer.issuer_name = name.to_string();
        Ok(())
    }

    async fn kv2_write(&self, mount: &str, path: &str, data: &Map<String, Value>) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        self.authorize(&state, &format!("{}/data/{}", mount, path))?;
        state.kv.insert(format!("{}/{}", mount, path), data.clone());
        Ok(())
    }

    async fn kv2_list(&self, mount: &str, path: &str) -> VaultsmithResult<Vec<String>> {
        let state = self.state.lock();
        self.authorize(&state, &format!("{}/metadata/{}", mount, path))?;
        let prefix = format!("{}/{}/", mount, path.trim_end_matches('/'));
        let children: BTreeSet<String> = state
            .kv
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .map(|rest| match rest.split_once('/') {
                Some((dir, _)) => format!("{}/", dir),
                None => rest.to_string(),
            })
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn kv2_delete_metadata(&self, mount: &str, path: &str) -> VaultsmithResult<()> {
        let mut state = self.state.lock();
        self.authorize(&state, &format!("{}/metadata/{}", mount, path))?;
        state.kv.remove(&format!("{}/{}", mount, path));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> MockVaultCluster {
        let cluster = MockVaultCluster::new();
        cluster
            .add_node("s1-n1", "https://10.0.0.1:8200", "10.0.0.1:8201")
            .add_node("s1-n2", "https://10.0.0.1:8210", "10.0.0.1:8211")
            .set_ha_address("https://vault.example.com:8200");
        cluster
    }

    async fn unseal(node: &MockVaultNode, keys: &[Secret]) -> SealStatus {
        let mut status = None;
        for key in keys {
            status = Some(node.unseal(key).await.unwrap());
        }
        status.unwrap()
    }

    #[tokio::test]
    async fn init_then_unseal_with_threshold() {
        let cluster = cluster();
        let first = cluster.client("https://10.0.0.1:8200");
        assert_eq!(first.health().await.unwrap().status_code, 501);

        let init = first
            .initialize(&InitRequest {
                secret_shares: 3,
                secret_threshold: 2,
            })
            .await
            .unwrap();
        assert_eq!(init.keys.len(), 3);
        assert!(first.health().await.unwrap().sealed);

        let partial = first.unseal(&init.keys[0]).await.unwrap();
        assert!(partial.sealed);
        assert_eq!(partial.progress, 1);

        let status = unseal(&first, &init.keys[1..]).await;
        assert!(!status.sealed);
        assert!(first.health().await.unwrap().is_ready());
        assert_eq!(cluster.raft_members(), vec!["s1-n1".to_string()]);
    }

    #[tokio::test]
    async fn second_init_is_rejected() {
        let cluster = cluster();
        let node = cluster.client("https://10.0.0.1:8200");
        let request = InitRequest {
            secret_shares: 1,
            secret_threshold: 1,
        };
        node.initialize(&request).await.unwrap();
        let err = node.initialize(&request).await.unwrap_err();
        assert_eq!(err.vault_status(), Some(400));
        assert_eq!(cluster.init_calls(), 2);
    }

    #[tokio::test]
    async fn authenticated_endpoints_require_a_live_token() {
        let cluster = cluster();
        let node = cluster.client("https://10.0.0.1:8200");
        let init = node
            .initialize(&InitRequest {
                secret_shares: 1,
                secret_threshold: 1,
            })
            .await
            .unwrap();
        node.unseal(&init.keys[0]).await.unwrap();

        assert!(!node.is_authenticated().await.unwrap());
        node.set_token(Some(init.root_token.clone()));
        assert!(node.is_authenticated().await.unwrap());

        let ha = cluster.client("https://vault.example.com:8200");
        ha.set_token(Some(init.root_token));
        assert_eq!(ha.raft_configuration().await.unwrap().len(), 1);

        ha.revoke_self().await.unwrap();
        assert!(ha.token().is_none());
        assert!(!node.is_authenticated().await.unwrap());
    }

    #[tokio::test]
    async fn factory_rejects_unknown_addresses() {
        let cluster = cluster();
        let endpoint = VaultEndpoint {
            url: "https://10.9.9.9:8200".to_string(),
            ca_cert_pem: String::new(),
            client_cert_pem: String::new(),
            client_key_pem: Secret::default(),
        };
        assert!(cluster.connect(&endpoint).is_err());
    }
}

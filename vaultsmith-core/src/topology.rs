//! Cluster topology resolution
//!
//! Expands the declarative `vault_servers` block into one [`RaftNode`] per
//! Vault process. Everything derived from the declaration (node IDs,
//! addresses, SAN entries, retry-join targets) is computed once here and
//! stored on the node; nothing is recomputed lazily later.
//!
//! ```text
//! vault_servers:                       RaftNode "vault_1-node_a"
//!   vault_1:                           ├─ api_addr     https://10.0.0.1:8200
//!     api_ip: 10.0.0.1          ──►    ├─ cluster_addr https://10.0.0.1:8201
//!     cluster_ip: 10.0.0.1             ├─ SANs         DNS:vault.example.com, IP:10.0.0.1
//!     vault_nodes:                     └─ retry_join   every other node
//!       node_a: {node_port: 8200, cluster_port: 8201}
//! ```

use crate::error::{VaultsmithError, VaultsmithResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

fn default_true() -> bool {
    true
}

fn join_all_other_nodes() -> Option<Vec<String>> {
    Some(Vec::new())
}

/// A host running one or more Vault processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultServer {
    #[serde(default)]
    pub api_addr_fqdn: Option<String>,
    #[serde(default)]
    pub api_ip: Option<String>,
    #[serde(default)]
    pub cluster_addr_fqdn: Option<String>,
    #[serde(default)]
    pub cluster_ip: Option<String>,
    pub vault_nodes: BTreeMap<String, VaultNode>,
    /// Free-form connection options for the provisioning collaborator
    #[serde(default)]
    pub ansible_opts: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub host_keys: Vec<String>,
    #[serde(default = "default_true")]
    pub root_ca_key_pem_as_ansible_priv_ssh_key: bool,
}

/// One Vault process on a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultNode {
    pub node_port: u16,
    pub cluster_port: u16,
    #[serde(default)]
    pub api_addr_fqdn: Option<String>,
    #[serde(default)]
    pub api_ip: Option<String>,
    #[serde(default)]
    pub cluster_addr_fqdn: Option<String>,
    #[serde(default)]
    pub cluster_ip: Option<String>,
    /// Node IDs to retry-join. Missing means every other node, an explicit
    /// `null` means none.
    #[serde(default = "join_all_other_nodes")]
    pub explicit_retry_join_nodes: Option<Vec<String>>,
}

/// A node this node lists in its `retry_join` stanza
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryJoinTarget {
    pub node_id: String,
    pub leader_api_addr: String,
}

/// Fully resolved identity of one Vault node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RaftNode {
    /// `{server_name}-{node_name}`
    pub node_id: String,
    pub server_name: String,
    pub node_name: String,
    pub node_port: u16,
    pub cluster_port: u16,
    pub api_addr_fqdn: Option<String>,
    pub api_ip: Option<IpAddr>,
    pub cluster_addr_fqdn: Option<String>,
    pub cluster_ip: Option<IpAddr>,
    pub api_addr: String,
    pub cluster_addr: String,
    /// Sorted, de-duplicated `DNS:`/`IP:` entries
    pub subject_alt_names: Vec<String>,
    pub retry_join: BTreeMap<String, RetryJoinTarget>,
    /// Per-node working directory for client credentials
    pub scratch_dir: PathBuf,
}

impl RaftNode {
    /// Address Raft advertises for this node: `host:cluster_port`
    pub fn raft_address(&self) -> String {
        format!(
            "{}:{}",
            url_host(self.cluster_ip, self.cluster_addr_fqdn.as_deref()),
            self.cluster_port
        )
    }
}

/// Resolved topology: server name → node ID → node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topology {
    pub servers: BTreeMap<String, BTreeMap<String, RaftNode>>,
}

impl Topology {
    /// Every node, servers and nodes in name order
    pub fn nodes(&self) -> impl Iterator<Item = &RaftNode> {
        self.servers.values().flat_map(|nodes| nodes.values())
    }

    pub fn node(&self, node_id: &str) -> Option<&RaftNode> {
        self.nodes().find(|node| node.node_id == node_id)
    }

    /// The node that receives the initialisation call
    pub fn first_node(&self) -> Option<&RaftNode> {
        self.nodes().next()
    }

    pub fn node_ids(&self) -> BTreeSet<String> {
        self.nodes().map(|node| node.node_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Union of every node's SAN entries
    pub fn all_subject_alt_names(&self) -> BTreeSet<String> {
        self.nodes()
            .flat_map(|node| node.subject_alt_names.iter().cloned())
            .collect()
    }
}

/// SAN entry for the public HA endpoint
pub fn ha_san_entry(ha_hostname: &str) -> String {
    if ha_hostname.parse::<IpAddr>().is_ok() {
        format!("IP:{}", ha_hostname)
    } else {
        format!("DNS:{}", ha_hostname)
    }
}

/// HTTPS address of the HA endpoint; IPv6 literals are bracketed
pub fn ha_url(ha_hostname: &str, port: u16) -> String {
    let ip = ha_hostname.parse::<IpAddr>().ok();
    format!("https://{}:{}", url_host(ip, Some(ha_hostname)), port)
}

fn url_host(ip: Option<IpAddr>, fqdn: Option<&str>) -> String {
    match (ip, fqdn) {
        (Some(IpAddr::V6(v6)), _) => format!("[{}]", v6),
        (Some(ip), _) => ip.to_string(),
        (None, Some(fqdn)) => fqdn.to_string(),
        (None, None) => String::new(),
    }
}

fn node_error(server: &str, node: &str, problem: impl std::fmt::Display) -> VaultsmithError {
    VaultsmithError::configuration(
        "vault_servers",
        format!("Vault Server: {}, Vault Node: {}, {}", server, node, problem),
    )
}

fn parse_ip(
    server: &str,
    node: &str,
    field: &str,
    value: Option<&String>,
) -> VaultsmithResult<Option<IpAddr>> {
    value
        .map(|raw| {
            raw.parse::<IpAddr>()
                .map_err(|_| node_error(server, node, format!("{} '{}' is not a valid IP address", field, raw)))
        })
        .transpose()
}

/// Resolve the declarative topology into concrete Raft nodes
pub fn resolve(
    servers: &BTreeMap<String, VaultServer>,
    ha_hostname: &str,
    tmp_dir: &Path,
) -> VaultsmithResult<Topology> {
    let ha_san = ha_san_entry(ha_hostname);
    let mut used_ports: BTreeMap<u16, String> = BTreeMap::new();
    let mut seen_ids: BTreeSet<String> = BTreeSet::new();
    let mut resolved: BTreeMap<String, BTreeMap<String, RaftNode>> = BTreeMap::new();

    for (server_name, server) in servers {
        for (node_name, node) in &server.vault_nodes {
            let api_addr_fqdn = node.api_addr_fqdn.clone().or_else(|| server.api_addr_fqdn.clone());
            let cluster_addr_fqdn = node
                .cluster_addr_fqdn
                .clone()
                .or_else(|| server.cluster_addr_fqdn.clone());
            let api_ip = parse_ip(
                server_name,
                node_name,
                "api_ip",
                node.api_ip.as_ref().or(server.api_ip.as_ref()),
            )?;
            let cluster_ip = parse_ip(
                server_name,
                node_name,
                "cluster_ip",
                node.cluster_ip.as_ref().or(server.cluster_ip.as_ref()),
            )?;

            if api_addr_fqdn.is_none() && api_ip.is_none() {
                return Err(node_error(
                    server_name,
                    node_name,
                    "at least one of api_addr_fqdn or api_ip is required",
                ));
            }
            if cluster_addr_fqdn.is_none() && cluster_ip.is_none() {
                return Err(node_error(
                    server_name,
                    node_name,
                    "at least one of cluster_addr_fqdn or cluster_ip is required",
                ));
            }

            if node.node_port == 0 || node.cluster_port == 0 {
                return Err(node_error(server_name, node_name, "ports must be non-zero"));
            }
            if node.node_port == node.cluster_port {
                return Err(node_error(
                    server_name,
                    node_name,
                    format!("node_port and cluster_port are both {}", node.node_port),
                ));
            }

            let node_id = format!("{}-{}", server_name, node_name);
            if !seen_ids.insert(node_id.clone()) {
                return Err(node_error(
                    server_name,
                    node_name,
                    format!("duplicate node id {}", node_id),
                ));
            }
            for (field, port) in [("node_port", node.node_port), ("cluster_port", node.cluster_port)] {
                if let Some(owner) = used_ports.insert(port, node_id.clone()) {
                    return Err(node_error(
                        server_name,
                        node_name,
                        format!("{} {} is already used by {}", field, port, owner),
                    ));
                }
            }

            let mut sans = BTreeSet::new();
            sans.insert(ha_san.clone());
            for fqdn in [&api_addr_fqdn, &cluster_addr_fqdn].into_iter().flatten() {
                sans.insert(format!("DNS:{}", fqdn));
            }
            for ip in [api_ip, cluster_ip].into_iter().flatten() {
                sans.insert(format!("IP:{}", ip));
            }

            let api_host = url_host(api_ip, api_addr_fqdn.as_deref());
            let cluster_host = url_host(cluster_ip, cluster_addr_fqdn.as_deref());

            let raft_node = RaftNode {
                api_addr: format!("https://{}:{}", api_host, node.node_port),
                cluster_addr: format!("https://{}:{}", cluster_host, node.cluster_port),
                scratch_dir: tmp_dir.join(&node_id),
                node_id: node_id.clone(),
                server_name: server_name.clone(),
                node_name: node_name.clone(),
                node_port: node.node_port,
                cluster_port: node.cluster_port,
                api_addr_fqdn,
                api_ip,
                cluster_addr_fqdn,
                cluster_ip,
                subject_alt_names: sans.into_iter().collect(),
                retry_join: BTreeMap::new(),
            };
            resolved
                .entry(server_name.clone())
                .or_default()
                .insert(node_id, raft_node);
        }
    }

    if seen_ids.is_empty() {
        return Err(VaultsmithError::configuration(
            "vault_servers",
            "no vault nodes are defined",
        ));
    }

    let targets: BTreeMap<String, RetryJoinTarget> = resolved
        .values()
        .flat_map(|nodes| nodes.values())
        .map(|node| {
            (
                node.node_id.clone(),
                RetryJoinTarget {
                    node_id: node.node_id.clone(),
                    leader_api_addr: node.api_addr.clone(),
                },
            )
        })
        .collect();

    for (server_name, nodes) in resolved.iter_mut() {
        let declared = &servers[server_name].vault_nodes;
        for raft_node in nodes.values_mut() {
            let mut others = targets.clone();
            others.remove(&raft_node.node_id);

            raft_node.retry_join = match &declared[&raft_node.node_name].explicit_retry_join_nodes {
                None => BTreeMap::new(),
                Some(explicit) if explicit.is_empty() => others,
                Some(explicit) => {
                    let mut filtered = BTreeMap::new();
                    for node_id in explicit {
                        let target = others.get(node_id).ok_or_else(|| {
                            node_error(
                                server_name,
                                &raft_node.node_name,
                                format!("retry_join_node_id {} not found in inventory", node_id),
                            )
                        })?;
                        filtered.insert(node_id.clone(), target.clone());
                    }
                    filtered
                }
            };
            debug!(
                "Resolved {} at {} (retry_join: {:?})",
                raft_node.node_id,
                raft_node.api_addr,
                raft_node.retry_join.keys().collect::<Vec<_>>()
            );
        }
    }

    Ok(Topology { servers: resolved })
}

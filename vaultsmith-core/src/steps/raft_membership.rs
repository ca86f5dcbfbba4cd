//! Reconcile Raft membership with the declared topology
//!
//! Members unknown to the topology are removed, declared nodes missing from
//! Raft are joined to the current leader, and the result is validated in
//! both directions. Validation failures are retryable: a freshly joined node
//! may take a moment to show up with its final address.

use crate::error::{VaultsmithError, VaultsmithResult};
use crate::node_client::NodeClient;
use crate::topology::Topology;
use crate::vault_api::{RaftJoinRequest, RaftServer};
use std::collections::BTreeSet;
use tracing::{info, warn};

pub async fn reconcile_raft(
    ready: &NodeClient,
    nodes: &[NodeClient],
    topology: &Topology,
    root_ca_pem: &str,
) -> VaultsmithResult<()> {
    remove_unknown_members(ready, topology).await?;
    join_missing_nodes(ready, nodes, root_ca_pem).await?;
    validate_membership(ready, topology).await
}

async fn remove_unknown_members(ready: &NodeClient, topology: &Topology) -> VaultsmithResult<()> {
    let declared = topology.node_ids();
    for server in ready.api().raft_configuration().await? {
        if !declared.contains(&server.node_id) {
            warn!(
                "Removing raft member {} ({}): not in inventory",
                server.node_id, server.address
            );
            ready.api().raft_remove_peer(&server.node_id).await?;
        }
    }
    Ok(())
}

async fn join_missing_nodes(
    ready: &NodeClient,
    nodes: &[NodeClient],
    root_ca_pem: &str,
) -> VaultsmithResult<()> {
    let servers = ready.api().raft_configuration().await?;
    let leader = servers
        .iter()
        .find(|server| server.leader)
        .ok_or_else(|| VaultsmithError::raft_not_converged("raft configuration reports no leader"))?;
    info!("Raft leader: {}", leader.node_id);

    let leader_client = nodes
        .iter()
        .find(|node| node.node_id() == leader.node_id)
        .ok_or_else(|| {
            VaultsmithError::raft_not_converged(format!(
                "raft leader {} is not in the current inventory",
                leader.node_id
            ))
        })?;

    let members: BTreeSet<&str> = servers.iter().map(|s| s.node_id.as_str()).collect();
    for node in nodes.iter().filter(|n| !members.contains(n.node_id())) {
        info!("Joining {} to raft via leader {}", node.node_id(), leader.node_id);
        let request = RaftJoinRequest {
            leader_api_addr: leader_client.node().api_addr.clone(),
            leader_ca_cert: root_ca_pem.to_string(),
            leader_client_cert: leader_client.client_cert_pem().to_string(),
            leader_client_key: leader_client.client_key_pem().clone(),
            retry: true,
        };
        let joined = node.api().raft_join(&request).await?;
        if joined {
            info!("{} joined raft", node.node_id());
        } else {
            warn!("{} did not confirm the raft join", node.node_id());
        }
    }
    Ok(())
}

fn check_member(server: &RaftServer, topology: &Topology) -> VaultsmithResult<()> {
    let node = topology.node(&server.node_id).ok_or_else(|| {
        VaultsmithError::raft_not_converged(format!(
            "Node ID {} not found in current inventory",
            server.node_id
        ))
    })?;
    let expected = node.raft_address();
    if server.address != expected {
        return Err(VaultsmithError::raft_not_converged(format!(
            "Node ID {} advertises {} but inventory expects {}",
            server.node_id, server.address, expected
        )));
    }
    Ok(())
}

async fn validate_membership(ready: &NodeClient, topology: &Topology) -> VaultsmithResult<()> {
    let servers = ready.api().raft_configuration().await?;
    for server in &servers {
        check_member(server, topology)?;
    }

    let members: BTreeSet<String> = servers.into_iter().map(|s| s.node_id).collect();
    let missing: Vec<String> = topology.node_ids().difference(&members).cloned().collect();
    if !missing.is_empty() {
        return Err(VaultsmithError::raft_not_converged(format!(
            "inventory nodes not in raft: {}",
            missing.join(", ")
        )));
    }
    info!("Raft membership matches inventory ({} nodes)", members.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::ready_node::find_ready_node;
    use crate::steps::test_support::Harness;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn joins_missing_nodes_once() {
        let (harness, _) = Harness::bootstrapped(3).await;
        let ready = find_ready_node(&harness.nodes).await.unwrap();
        let ca_pem = harness.ca.certificate_pem().unwrap();

        reconcile_raft(ready, &harness.nodes, &harness.topology, &ca_pem).await.unwrap();
        assert_eq!(harness.cluster.join_calls(), 2);
        assert_eq!(
            harness.cluster.raft_members(),
            vec!["vault_1-node_a", "vault_2-node_a", "vault_3-node_a"]
        );

        reconcile_raft(ready, &harness.nodes, &harness.topology, &ca_pem).await.unwrap();
        assert_eq!(harness.cluster.join_calls(), 2);
    }

    #[tokio::test]
    async fn removes_members_missing_from_inventory() {
        let (harness, _) = Harness::bootstrapped(2).await;
        harness.cluster.add_foreign_raft_member("retired-node", "10.0.9.9:8201");
        let ready = find_ready_node(&harness.nodes).await.unwrap();
        let ca_pem = harness.ca.certificate_pem().unwrap();

        reconcile_raft(ready, &harness.nodes, &harness.topology, &ca_pem).await.unwrap();
        assert_eq!(harness.cluster.remove_calls(), 1);
        assert!(!harness.cluster.raft_members().contains(&"retired-node".to_string()));
    }

    #[tokio::test]
    async fn wrong_advertised_address_is_retryable() {
        let (harness, _) = Harness::bootstrapped(2).await;
        harness.cluster.add_foreign_raft_member("vault_2-node_a", "10.0.9.9:8201");
        let ready = find_ready_node(&harness.nodes).await.unwrap();
        let ca_pem = harness.ca.certificate_pem().unwrap();

        let err = reconcile_raft(ready, &harness.nodes, &harness.topology, &ca_pem)
            .await
            .unwrap_err();
        assert!(matches!(err, VaultsmithError::RaftNotConverged { .. }));
        assert!(err.is_retryable());
        assert_eq!(harness.cluster.join_calls(), 0);
    }
}

//! Pick the node that answers as the active leader

use crate::error::{VaultsmithError, VaultsmithResult};
use crate::node_client::NodeClient;
use tracing::{debug, info};

/// First node, in topology order, that is initialized, unsealed and active
pub async fn find_ready_node(nodes: &[NodeClient]) -> VaultsmithResult<&NodeClient> {
    for node in nodes {
        let health = node.api().health().await?;
        debug!(
            "{} health: initialized={} sealed={} standby={} status={}",
            node.node_id(),
            health.initialized,
            health.sealed,
            health.standby,
            health.status_code
        );
        if health.is_ready() {
            info!("Ready node: {}", node.node_id());
            return Ok(node);
        }
    }
    Err(VaultsmithError::NoReadyNode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::Harness;

    #[tokio::test]
    async fn picks_the_active_node() {
        let (harness, _) = Harness::bootstrapped(3).await;
        let ready = find_ready_node(&harness.nodes).await.unwrap();
        assert_eq!(Some(ready.node_id().to_string()), harness.cluster.leader());
    }

    #[tokio::test]
    async fn sealed_cluster_has_no_ready_node() {
        let (harness, _) = Harness::bootstrapped(2).await;
        harness.cluster.seal_all();
        let err = find_ready_node(&harness.nodes).await.unwrap_err();
        assert!(matches!(err, VaultsmithError::NoReadyNode));
        assert!(err.is_retryable());
    }
}

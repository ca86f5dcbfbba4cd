//! Unseal every initialized node with the stored key shares

use crate::error::{VaultsmithError, VaultsmithResult};
use crate::node_client::NodeClient;
use crate::storage::ClusterStore;
use tracing::{debug, info, warn};

pub async fn unseal_nodes(nodes: &[NodeClient], store: &ClusterStore) -> VaultsmithResult<()> {
    let mut keys = None;

    for node in nodes {
        let health = node.api().health().await?;
        if !health.initialized {
            info!("Skipping unseal of {}: not initialized", node.node_id());
            continue;
        }
        if !health.sealed {
            debug!("{} is already unsealed", node.node_id());
            continue;
        }

        if keys.is_none() {
            let bundle = store.unseal_keys().await?.ok_or_else(|| {
                VaultsmithError::orchestration("unseal", "nodes are sealed but no unseal keys are stored")
            })?;
            keys = Some(bundle.hex_keys()?);
        }
        let hex_keys = keys.as_deref().unwrap_or_default();

        info!("Unsealing {}", node.node_id());
        let mut sealed = true;
        for key in hex_keys {
            let status = node.api().unseal(key).await?;
            debug!(
                "{} unseal progress {}/{}",
                node.node_id(),
                status.progress,
                status.threshold
            );
            if !status.sealed {
                sealed = false;
                break;
            }
        }

        if sealed {
            warn!("{} is still sealed after submitting every stored key", node.node_id());
        } else {
            info!("Unsealed {}", node.node_id());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::ScriptedPrompt;
    use crate::steps::initialize::initialize_cluster;
    use crate::steps::test_support::Harness;

    #[tokio::test]
    async fn unseals_every_initialized_node() {
        let harness = Harness::new(3).await;
        initialize_cluster(&harness.nodes, &harness.store, &ScriptedPrompt::accept(5, 3))
            .await
            .unwrap();

        unseal_nodes(&harness.nodes, &harness.store).await.unwrap();
        for node in &harness.nodes {
            assert_eq!(harness.cluster.is_sealed(node.node_id()), Some(false));
        }

        // Second pass is a no-op
        unseal_nodes(&harness.nodes, &harness.store).await.unwrap();
    }

    #[tokio::test]
    async fn uninitialized_cluster_is_skipped() {
        let harness = Harness::new(2).await;
        unseal_nodes(&harness.nodes, &harness.store).await.unwrap();
        assert_eq!(harness.cluster.is_sealed("vault_1-node_a"), Some(true));
    }

    #[tokio::test]
    async fn sealed_nodes_without_keys_are_retryable() {
        let harness = Harness::new(1).await;
        initialize_cluster(&harness.nodes, &harness.store, &ScriptedPrompt::accept(1, 1))
            .await
            .unwrap();
        let empty = crate::storage::ClusterStore::new(std::sync::Arc::new(
            crate::storage::MemoryStorage::new(),
        ));
        let err = unseal_nodes(&harness.nodes, &empty).await.unwrap_err();
        assert!(err.is_retryable());
    }
}

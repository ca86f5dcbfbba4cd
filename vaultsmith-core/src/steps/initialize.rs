//! First-time cluster initialization

use crate::error::{VaultsmithError, VaultsmithResult};
use crate::node_client::NodeClient;
use crate::prompt::OperatorPrompt;
use crate::storage::{ClusterStore, UnsealBundle};
use crate::vault_api::InitRequest;
use tracing::info;

/// Initialize the cluster through its first node unless some node already is
///
/// Returns whether initialization happened in this call.
pub async fn initialize_cluster(
    nodes: &[NodeClient],
    store: &ClusterStore,
    prompt: &dyn OperatorPrompt,
) -> VaultsmithResult<bool> {
    for node in nodes {
        if node.api().is_initialized().await? {
            info!("Vault cluster already initialized ({} reports initialized)", node.node_id());
            return Ok(false);
        }
    }

    if store.unseal_keys().await?.is_some() {
        return Err(VaultsmithError::inconsistent_state(
            "no node is initialized but unseal keys already exist in storage",
        ));
    }
    if store.terraform_state().await?.is_some() {
        return Err(VaultsmithError::inconsistent_state(
            "no node is initialized but terraform state already exists in storage",
        ));
    }

    if !prompt.confirm_initialize().await? {
        return Err(VaultsmithError::safe_exit("operator declined cluster initialization"));
    }
    let (secret_shares, secret_threshold) = prompt.key_shares_and_threshold().await?;
    if secret_shares < 1 || secret_threshold < 1 {
        return Err(VaultsmithError::configuration(
            "initialize",
            "key shares and key threshold must both be at least 1",
        ));
    }
    if secret_shares < secret_threshold {
        return Err(VaultsmithError::configuration(
            "initialize",
            format!(
                "key shares ({}) must be greater than or equal to key threshold ({})",
                secret_shares, secret_threshold
            ),
        ));
    }

    let first = nodes
        .first()
        .ok_or_else(|| VaultsmithError::configuration("topology", "no Vault nodes are defined"))?;
    info!(
        "Initializing Vault cluster on {} with {} shares and threshold {}",
        first.node_id(),
        secret_shares,
        secret_threshold
    );
    let response = first
        .api()
        .initialize(&InitRequest {
            secret_shares,
            secret_threshold,
        })
        .await?;

    store
        .save_unseal_keys(&UnsealBundle {
            keys: response.keys,
            keys_base64: response.keys_base64,
            root_token: response.root_token,
            secret_shares: Some(secret_shares),
            secret_threshold: Some(secret_threshold),
        })
        .await?;

    if !first.api().is_initialized().await? {
        return Err(VaultsmithError::orchestration(
            "initialize",
            format!("{} does not report initialized after init", first.node_id()),
        ));
    }
    info!("Vault cluster initialized");
    Ok(true)
}

//! Raft snapshot backup

use crate::error::{VaultsmithError, VaultsmithResult};
use crate::storage::ClusterStore;
use crate::vault_api::VaultApi;
use tracing::info;

/// Download a Raft snapshot and store it under the snapshot key
pub async fn take_snapshot(api: &dyn VaultApi, store: &ClusterStore) -> VaultsmithResult<usize> {
    let snapshot = api.raft_snapshot().await?;
    if snapshot.is_empty() {
        return Err(VaultsmithError::orchestration("snapshot", "Vault returned an empty raft snapshot"));
    }
    info!("Downloaded {} byte raft snapshot from {}", snapshot.len(), api.address());
    store.save_raft_snapshot(&snapshot).await?;
    Ok(snapshot.len())
}

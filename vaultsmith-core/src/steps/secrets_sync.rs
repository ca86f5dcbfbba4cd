//! Mirror the external services tree into KV v2
//!
//! ```text
//! external_services:                 secret/external_services
//!   region: eu                  ──►    {region: eu}
//!   github:                          secret/external_services/github
//!     org: acme                        {org: acme}
//!     app: {id: 7}                   secret/external_services/github/app
//!                                      {id: 7}
//! ```

use crate::error::VaultsmithResult;
use crate::vault_api::VaultApi;
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, info};

pub const KV_MOUNT: &str = "secret";
pub const EXTERNAL_SERVICES_PATH: &str = "external_services";

type BoxedStep<'a, T> = Pin<Box<dyn Future<Output = VaultsmithResult<T>> + Send + 'a>>;

/// Delete every secret below `path`, depth first
fn delete_tree(api: &dyn VaultApi, path: String) -> BoxedStep<'_, ()> {
    Box::pin(async move {
        for child in api.kv2_list(KV_MOUNT, &path).await? {
            let child_path = format!("{}/{}", path, child.trim_end_matches('/'));
            if child.ends_with('/') {
                delete_tree(api, child_path).await?;
            } else {
                debug!("Deleting {}/{}", KV_MOUNT, child_path);
                api.kv2_delete_metadata(KV_MOUNT, &child_path).await?;
            }
        }
        Ok(())
    })
}

/// Write the scalar leaves of `branch` at `path` and recurse into nested maps
fn write_branch<'a>(api: &'a dyn VaultApi, path: String, branch: &'a Map<String, Value>) -> BoxedStep<'a, usize> {
    Box::pin(async move {
        let mut written = 0;
        let leaves: Map<String, Value> = branch
            .iter()
            .filter(|(_, value)| !value.is_object())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !leaves.is_empty() {
            api.kv2_write(KV_MOUNT, &path, &leaves).await?;
            written += 1;
        }
        for (key, value) in branch {
            if let Value::Object(child) = value {
                written += write_branch(api, format!("{}/{}", path, key), child).await?;
            }
        }
        Ok(written)
    })
}

/// Replace `secret/external_services` with `tree`
pub async fn sync_external_services(api: &dyn VaultApi, tree: &Map<String, Value>) -> VaultsmithResult<()> {
    delete_tree(api, EXTERNAL_SERVICES_PATH.to_string()).await?;
    api.kv2_delete_metadata(KV_MOUNT, EXTERNAL_SERVICES_PATH).await?;
    if tree.is_empty() {
        info!("No external services to sync");
        return Ok(());
    }
    let written = write_branch(api, EXTERNAL_SERVICES_PATH.to_string(), tree).await?;
    info!("Synced {} external service secrets to {}/{}", written, KV_MOUNT, EXTERNAL_SERVICES_PATH);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::Harness;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn tree(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn splits_branches_and_drops_stale_paths() {
        let (harness, _) = Harness::bootstrapped(1).await;
        harness
            .cluster
            .seed_kv(KV_MOUNT, "external_services/old/deep", tree(json!({"x": 1})));
        let api = harness.nodes[0].api();

        sync_external_services(
            api,
            &tree(json!({
                "region": "eu",
                "github": {"org": "acme", "app": {"id": 7}},
            })),
        )
        .await
        .unwrap();

        assert_eq!(
            harness.cluster.kv_paths(KV_MOUNT),
            vec![
                "external_services",
                "external_services/github",
                "external_services/github/app",
            ]
        );
        assert_eq!(
            harness.cluster.kv_secret(KV_MOUNT, "external_services/github"),
            Some(tree(json!({"org": "acme"})))
        );
        assert_eq!(
            harness.cluster.kv_secret(KV_MOUNT, "external_services/github/app"),
            Some(tree(json!({"id": 7})))
        );
    }

    #[tokio::test]
    async fn empty_tree_only_clears() {
        let (harness, _) = Harness::bootstrapped(1).await;
        harness
            .cluster
            .seed_kv(KV_MOUNT, "external_services/old", tree(json!({"x": 1})));

        sync_external_services(harness.nodes[0].api(), &Map::new()).await.unwrap();
        assert!(harness.cluster.kv_paths(KV_MOUNT).is_empty());
    }
}

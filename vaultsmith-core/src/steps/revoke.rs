//! Revoke credentials left over from bootstrap
//!
//! Every token except the caller's own is revoked, then every AppRole
//! secret ID on every AppRole mount is destroyed, and finally the caller's
//! token is revoked as well. Errors Vault raises for entries that vanished
//! in the meantime are logged and skipped.

use crate::error::{VaultsmithError, VaultsmithResult};
use crate::vault_api::VaultApi;
use tracing::{debug, info, warn};

fn is_gone(err: &VaultsmithError) -> bool {
    matches!(err.vault_status(), Some(400) | Some(404))
}

async fn revoke_other_tokens(api: &dyn VaultApi) -> VaultsmithResult<()> {
    let current = api.lookup_self().await?.accessor;
    let mut revoked = 0usize;

    for accessor in api.list_token_accessors().await? {
        if accessor == current {
            continue;
        }
        let info = match api.lookup_accessor(&accessor).await {
            Ok(info) => info,
            Err(e) if is_gone(&e) => {
                warn!("Skipping token accessor {}: {}", accessor, e);
                continue;
            }
            Err(e) => return Err(e),
        };
        match api.revoke_accessor(&accessor).await {
            Ok(()) => {
                debug!("Revoked token {} ({})", accessor, info.display_name);
                revoked += 1;
            }
            Err(e) if e.vault_status() == Some(400) => {
                warn!("Could not revoke token accessor {}: {}", accessor, e);
            }
            Err(e) => return Err(e),
        }
    }
    info!("Revoked {} tokens", revoked);
    Ok(())
}

async fn destroy_approle_secret_ids(api: &dyn VaultApi) -> VaultsmithResult<()> {
    for (path, method) in api.list_auth_methods().await? {
        if method.kind != "approle" {
            continue;
        }
        let mount = path.trim_end_matches('/');
        for role in api.list_approle_roles(mount).await? {
            let accessors = api.list_secret_id_accessors(mount, &role).await?;
            for accessor in &accessors {
                match api.destroy_secret_id_accessor(mount, &role, accessor).await {
                    Ok(()) => {}
                    Err(e) if is_gone(&e) => warn!("Skipping secret ID {} of {}/{}: {}", accessor, mount, role, e),
                    Err(e) => return Err(e),
                }
            }
            if !accessors.is_empty() {
                info!("Destroyed {} secret IDs of role {} at {}", accessors.len(), role, mount);
            }
        }
    }
    Ok(())
}

/// Revoke every other token and AppRole secret ID, then the caller's own token
pub async fn revoke_transient_credentials(api: &dyn VaultApi) -> VaultsmithResult<()> {
    revoke_other_tokens(api).await?;
    destroy_approle_secret_ids(api).await?;
    api.revoke_self().await?;
    info!("Revoked own token on {}", api.address());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::Harness;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn leaves_no_tokens_or_secret_ids_behind() {
        let (harness, _) = Harness::bootstrapped(1).await;
        harness.cluster.seed_token("ci");
        harness.cluster.seed_token("operator");
        harness.cluster.seed_approle("approle", "deployer", &["a1", "a2"]);
        harness.cluster.seed_approle("machines", "runner", &["b1"]);
        assert_eq!(harness.cluster.token_count(), 3);

        let api = harness.nodes[0].api();
        revoke_transient_credentials(api).await.unwrap();

        assert_eq!(harness.cluster.token_count(), 0);
        assert!(harness.cluster.secret_id_accessors("approle", "deployer").is_empty());
        assert!(harness.cluster.secret_id_accessors("machines", "runner").is_empty());
        assert!(api.token().is_none());
    }
}

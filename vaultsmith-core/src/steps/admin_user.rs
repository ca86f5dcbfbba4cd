//! Admin policy and userpass login

use crate::config::AdminUserpassDetails;
use crate::error::VaultsmithResult;
use crate::vault_api::{MountTune, UserpassUser, VaultApi};
use tracing::info;

pub const ADMIN_POLICY: &str =
    r#"path "*" {capabilities = ["create", "read", "update", "delete", "list", "sudo"]}"#;

/// Create the wildcard admin policy and the admin userpass user bound to it
pub async fn configure_admin_user(api: &dyn VaultApi, details: &AdminUserpassDetails) -> VaultsmithResult<()> {
    let mount = &details.vault_admin_userpass_mount_path;

    api.put_policy(&details.vault_admin_policy_name, ADMIN_POLICY).await?;
    info!("Wrote policy {}", details.vault_admin_policy_name);

    let auth_methods = api.list_auth_methods().await?;
    if !auth_methods.contains_key(&format!("{}/", mount)) {
        api.enable_auth_method(mount, "userpass").await?;
        info!("Enabled userpass auth method at {}", mount);
    }
    api.tune_auth_method(
        mount,
        &MountTune {
            description: Some("Userpass auth method for admin user".to_string()),
            default_lease_ttl: Some("1h".to_string()),
            max_lease_ttl: Some("24h".to_string()),
        },
    )
    .await?;

    api.write_userpass_user(
        mount,
        &details.vault_admin_user,
        &UserpassUser {
            password: details.vault_admin_password.clone(),
            token_policies: vec![details.vault_admin_policy_name.clone(), "default".to_string()],
            token_ttl: "1h".to_string(),
        },
    )
    .await?;
    info!("Wrote admin user {} at auth/{}", details.vault_admin_user, mount);
    Ok(())
}

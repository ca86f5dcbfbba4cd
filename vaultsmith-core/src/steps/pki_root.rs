//! Root CA as a PKI secrets engine issuer

use crate::error::{VaultsmithError, VaultsmithResult};
use crate::pki::CertificateAuthority;
use crate::vault_api::{serials_match, MountTune, VaultApi};
use tracing::{info, warn};

pub const PKI_MOUNT: &str = "root-ca";
pub const ROOT_ISSUER_NAME: &str = "root-ca-issuer";
const PKI_TTL: &str = "350400h";

/// Mount the PKI engine, load the root CA and make it the only, default issuer
pub async fn configure_root_pki(api: &dyn VaultApi, ca: &CertificateAuthority) -> VaultsmithResult<()> {
    let tune = MountTune {
        description: None,
        default_lease_ttl: Some(PKI_TTL.to_string()),
        max_lease_ttl: Some(PKI_TTL.to_string()),
    };
    let mounts = api.list_mounts().await?;
    if !mounts.contains_key(&format!("{}/", PKI_MOUNT)) {
        api.enable_secrets_engine(PKI_MOUNT, "pki", &tune).await?;
        info!("Enabled PKI secrets engine at {}", PKI_MOUNT);
    }
    api.tune_mount(PKI_MOUNT, &tune).await?;

    api.pki_submit_ca(PKI_MOUNT, &ca.pem_bundle()?).await?;
    let serial = ca.serial_hex()?;

    let issuers = api.pki_list_issuers(PKI_MOUNT).await?;
    let root_issuer = issuers
        .iter()
        .find(|(_, issuer)| serials_match(&issuer.serial_number, &serial))
        .map(|(id, _)| id.clone())
        .ok_or_else(|| {
            VaultsmithError::orchestration(
                "pki_root",
                format!("no issuer at {} matches root CA serial {}", PKI_MOUNT, serial),
            )
        })?;
    api.pki_set_default_issuer(PKI_MOUNT, &root_issuer).await?;
    info!("Default issuer at {} is {}", PKI_MOUNT, root_issuer);

    for (id, issuer) in api.pki_list_issuers(PKI_MOUNT).await? {
        if id != root_issuer {
            warn!(
                "Deleting issuer {} (serial {}) from {}",
                id, issuer.serial_number, PKI_MOUNT
            );
            api.pki_delete_issuer(PKI_MOUNT, &id).await?;
        }
    }

    api.pki_name_issuer(PKI_MOUNT, &root_issuer, ROOT_ISSUER_NAME).await?;
    Ok(())
}

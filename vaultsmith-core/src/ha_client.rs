//! Admin client for the load-balanced Vault address
//!
//! The HA client's certificate covers every node's SANs plus the public HA
//! hostname, so the same identity works whichever node answers. Its
//! credentials are written to the scratch directory for collaborators
//! (Terraform, operators) and packaged as PKCS#12 for browsers.

use crate::config::VaultSecrets;
use crate::error::{VaultsmithError, VaultsmithResult};
use crate::node_client::CLIENT_CERT_DAYS;
use crate::pki::{
    ensure_certificate_content, ensure_private_key_content, pkcs12_bundle, write_private_file,
    write_public_file, CertificateAuthority, CertificateProperties, DEFAULT_KEY_SIZE,
    DEFAULT_PUBLIC_EXPONENT,
};
use crate::topology::{ha_san_entry, ha_url, Topology};
use crate::types::Secret;
use crate::vault_api::{VaultApi, VaultApiFactory, VaultEndpoint};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const HA_CLIENT_COMMON_NAME: &str = "vault_ha_client_cert";
pub const PKCS12_FRIENDLY_NAME: &str = "vault_master_client_certificate";

/// Files written for the HA client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaArtifacts {
    pub settings_file: PathBuf,
    pub root_ca_file: PathBuf,
    pub client_cert_file: PathBuf,
    pub client_key_file: PathBuf,
    pub pkcs12_file: PathBuf,
}

impl HaArtifacts {
    fn in_dir(dir: &Path) -> Self {
        Self {
            settings_file: dir.join("vault-ha-client.yml"),
            root_ca_file: dir.join("vault-ha-root-ca.pem"),
            client_cert_file: dir.join("vault-ha-client-cert.pem"),
            client_key_file: dir.join("vault-ha-client-priv.key"),
            pkcs12_file: dir.join("vault-ha-client-cert.p12"),
        }
    }
}

/// Connection settings shared with collaborators; never holds secrets
#[derive(Debug, Serialize)]
struct HaClientSettings<'a> {
    url: &'a str,
    ca_cert_file: &'a Path,
    client_cert_file: &'a Path,
    client_key_file: &'a Path,
    userpass_mount: &'a str,
    username: &'a str,
}

pub struct HaClient {
    api: Arc<dyn VaultApi>,
    hostname: String,
    port: u16,
    userpass_mount: String,
    username: String,
    password: Secret,
    artifacts: HaArtifacts,
}

impl std::fmt::Debug for HaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaClient")
            .field("url", &self.api.address())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl HaClient {
    /// Issue the HA client certificate, persist its artifacts and connect
    pub async fn build(
        topology: &Topology,
        secrets: &VaultSecrets,
        ca: &CertificateAuthority,
        tmp_dir: &Path,
        factory: &dyn VaultApiFactory,
    ) -> VaultsmithResult<Self> {
        let admin = &secrets.vault_admin_userpass_details;
        let mut sans: BTreeSet<String> = topology.all_subject_alt_names();
        sans.insert(ha_san_entry(&secrets.vault_ha_hostname));

        let key = ensure_private_key_content(None, None, DEFAULT_KEY_SIZE, DEFAULT_PUBLIC_EXPONENT)?;
        let properties = CertificateProperties::client_auth(
            HA_CLIENT_COMMON_NAME,
            sans.into_iter().collect(),
            CLIENT_CERT_DAYS,
        );
        let certificate = ensure_certificate_content(&key.key, &properties, None, Some(ca))?;
        let pkcs12 = pkcs12_bundle(
            PKCS12_FRIENDLY_NAME,
            &key.key,
            &certificate.certificate,
            ca,
            &admin.vault_admin_client_cert_p12_passphrase,
        )?;

        let url = ha_url(&secrets.vault_ha_hostname, secrets.vault_ha_port);
        let ca_pem = ca.certificate_pem()?;
        let artifacts = HaArtifacts::in_dir(tmp_dir);
        let settings = HaClientSettings {
            url: &url,
            ca_cert_file: &artifacts.root_ca_file,
            client_cert_file: &artifacts.client_cert_file,
            client_key_file: &artifacts.client_key_file,
            userpass_mount: &admin.vault_admin_userpass_mount_path,
            username: &admin.vault_admin_user,
        };
        let settings_yaml = serde_yaml::to_string(&settings)
            .map_err(|e| VaultsmithError::serialization("encode HA client settings", e))?;

        write_public_file(&artifacts.settings_file, settings_yaml.as_bytes()).await?;
        write_public_file(&artifacts.root_ca_file, ca_pem.as_bytes()).await?;
        write_public_file(&artifacts.client_cert_file, certificate.full_chain_pem.as_bytes()).await?;
        write_private_file(&artifacts.client_key_file, key.pem.expose().as_bytes()).await?;
        write_private_file(&artifacts.pkcs12_file, &pkcs12).await?;
        debug!("Wrote HA client artifacts to {}", tmp_dir.display());

        let api = factory.connect(&VaultEndpoint {
            url,
            ca_cert_pem: ca_pem,
            client_cert_pem: certificate.full_chain_pem,
            client_key_pem: key.pem,
        })?;
        info!("Created Vault HA client for {}", api.address());

        Ok(Self {
            api,
            hostname: secrets.vault_ha_hostname.clone(),
            port: secrets.vault_ha_port,
            userpass_mount: admin.vault_admin_userpass_mount_path.clone(),
            username: admin.vault_admin_user.clone(),
            password: admin.vault_admin_password.clone(),
            artifacts,
        })
    }

    pub fn api(&self) -> &dyn VaultApi {
        self.api.as_ref()
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn userpass_mount(&self) -> &str {
        &self.userpass_mount
    }

    pub fn password(&self) -> &Secret {
        &self.password
    }

    pub fn artifacts(&self) -> &HaArtifacts {
        &self.artifacts
    }

    /// Log in with the admin userpass credentials unless the current token still works
    pub async fn ensure_authenticated(&self) -> VaultsmithResult<()> {
        if self.api.is_authenticated().await? {
            return Ok(());
        }
        debug!("HA client token missing or expired, logging in as {}", self.username);
        self.api
            .userpass_login(&self.userpass_mount, &self.username, &self.password)
            .await?;
        info!("HA client authenticated as {}", self.username);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::vault_secrets as secrets;
    use crate::vault_api::{InitRequest, MockVaultCluster, MountTune, UserpassUser};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_artifacts_and_logs_in_on_demand() {
        let tmp = TempDir::new().unwrap();
        let ca = CertificateAuthority::generate("test root", 365).unwrap();
        let cluster = MockVaultCluster::new();
        cluster
            .add_node("s-n", "https://10.0.0.1:8200", "10.0.0.1:8201")
            .set_ha_address("https://vault.example.com:8200");
        let topology = Topology {
            servers: BTreeMap::new(),
        };

        let ha = HaClient::build(&topology, &secrets(&ca), &ca, tmp.path(), &cluster)
            .await
            .unwrap();
        let artifacts = ha.artifacts();
        for file in [
            &artifacts.settings_file,
            &artifacts.root_ca_file,
            &artifacts.client_cert_file,
            &artifacts.client_key_file,
            &artifacts.pkcs12_file,
        ] {
            assert!(file.exists(), "{} missing", file.display());
        }
        let settings = std::fs::read_to_string(&artifacts.settings_file).unwrap();
        assert!(settings.contains("https://vault.example.com:8200"));
        assert!(!settings.contains("correct horse"));

        let der = std::fs::read(&artifacts.pkcs12_file).unwrap();
        let parsed = openssl::pkcs12::Pkcs12::from_der(&der).unwrap().parse2("p12").unwrap();
        assert!(parsed.pkey.is_some());

        // Prepare the admin user directly, then expect a login
        let node = cluster.client("https://10.0.0.1:8200");
        let init = node
            .initialize(&InitRequest {
                secret_shares: 1,
                secret_threshold: 1,
            })
            .await
            .unwrap();
        node.unseal(&init.keys[0]).await.unwrap();
        node.set_token(Some(init.root_token));
        node.enable_auth_method("userpass", "userpass").await.unwrap();
        node.tune_auth_method("userpass", &MountTune::default()).await.unwrap();
        node.write_userpass_user(
            "userpass",
            "admin",
            &UserpassUser {
                password: Secret::new("correct horse"),
                token_policies: vec!["admin".to_string(), "default".to_string()],
                token_ttl: "1h".to_string(),
            },
        )
        .await
        .unwrap();

        assert!(!ha.api().is_authenticated().await.unwrap());
        ha.ensure_authenticated().await.unwrap();
        assert!(ha.api().is_authenticated().await.unwrap());
        let tokens = cluster.token_count();
        ha.ensure_authenticated().await.unwrap();
        assert_eq!(cluster.token_count(), tokens);
    }

    #[tokio::test]
    async fn ipv6_ha_hostname_is_bracketed() {
        let tmp = TempDir::new().unwrap();
        let ca = CertificateAuthority::generate("test root", 365).unwrap();
        let cluster = MockVaultCluster::new();
        cluster.set_ha_address("https://[fd00::10]:8200");
        let topology = Topology {
            servers: BTreeMap::new(),
        };
        let mut secrets = secrets(&ca);
        secrets.vault_ha_hostname = "fd00::10".to_string();

        let ha = HaClient::build(&topology, &secrets, &ca, tmp.path(), &cluster)
            .await
            .unwrap();

        assert_eq!(ha.api().address(), "https://[fd00::10]:8200");
        let settings = std::fs::read_to_string(&ha.artifacts().settings_file).unwrap();
        assert!(settings.contains("https://[fd00::10]:8200"), "{}", settings);
    }
}

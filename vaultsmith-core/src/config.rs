//! Cluster configuration
//!
//! A configuration file names a scratch directory, a storage backend and
//! (optionally inline) the `vault_config` blob holding the server topology
//! and the cluster secrets. When the blob is not inline it is read from the
//! storage backend under `vault_config.yml`.
//!
//! Files ending in `.toml` are parsed as TOML, everything else as YAML.
//! Environment variables override selected settings after parsing:
//!
//! | Variable                          | Overrides                     |
//! |-----------------------------------|-------------------------------|
//! | `VAULTSMITH_TMP_DIR`              | `tmp_dir_path`                |
//! | `VAULTSMITH_STORAGE_PATH`         | local backend `path`          |
//! | `VAULTSMITH_S3_BUCKET`            | S3 backend `bucket`           |
//! | `VAULTSMITH_S3_ENDPOINT`          | S3 backend `endpoint_url`     |
//! | `VAULTSMITH_S3_ACCESS_KEY_ID`     | S3 backend `access_key_id`    |
//! | `VAULTSMITH_S3_SECRET_ACCESS_KEY` | S3 backend `secret_access_key`|

use crate::error::{VaultsmithError, VaultsmithResult};
use crate::storage::StorageConfig;
use crate::topology::VaultServer;
use crate::types::Secret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for one orchestration run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Absolute scratch directory for generated credentials
    pub tmp_dir_path: PathBuf,
    /// Directory the configuration was loaded from
    #[serde(default)]
    pub config_dir_path: Option<PathBuf>,
    pub storage: StorageConfig,
    /// Terraform working directory; the apply step is skipped when unset
    #[serde(default)]
    pub terraform_dir: Option<PathBuf>,
    #[serde(default)]
    pub orchestration: OrchestrationSettings,
    #[serde(default)]
    pub vault_config: Option<VaultConfig>,
}

/// Outer retry loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationSettings {
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_wait: Duration,
}

impl Default for OrchestrationSettings {
    fn default() -> Self {
        Self {
            attempts: 5,
            retry_wait: Duration::from_secs(10),
        }
    }
}

/// Topology plus secrets, either inline or stored as `vault_config.yml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub vault_servers: BTreeMap<String, VaultServer>,
    pub vault_secrets: VaultSecrets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultSecrets {
    pub vault_ha_hostname: String,
    pub vault_ha_port: u16,
    pub root_pki_details: RootPkiDetails,
    pub vault_admin_userpass_details: AdminUserpassDetails,
    /// Arbitrary tree mirrored into the KV store
    #[serde(default)]
    pub external_services: serde_json::Map<String, serde_json::Value>,
    // Consumed by collaborators outside the core
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_gpg_key: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ansible_inventory: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootPkiDetails {
    pub root_ca_key_pem: Secret,
    pub root_ca_cert_pem: String,
    pub root_ca_key_password: Secret,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminUserpassDetails {
    pub vault_admin_user: String,
    pub vault_admin_password: Secret,
    pub vault_admin_userpass_mount_path: String,
    pub vault_admin_policy_name: String,
    pub vault_admin_client_cert_p12_passphrase: Secret,
}

impl ClusterConfig {
    /// Load, apply environment overrides, validate and create the scratch directory
    pub fn from_file<P: AsRef<Path>>(path: P) -> VaultsmithResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            VaultsmithError::configuration(
                "config",
                format!("Failed to read config file {}: {}", path.display(), e),
            )
        })?;

        let is_toml = path.extension().and_then(|ext| ext.to_str()) == Some("toml");
        let mut config = if is_toml {
            Self::from_toml_str(&contents)?
        } else {
            Self::from_yaml_str(&contents)?
        };

        if config.config_dir_path.is_none() {
            config.config_dir_path = path
                .canonicalize()
                .ok()
                .and_then(|p| p.parent().map(Path::to_path_buf));
        }

        config.apply_env_overrides();
        config.validate()?;
        config.prepare_tmp_dir()?;
        Ok(config)
    }

    pub fn from_yaml_str(contents: &str) -> VaultsmithResult<Self> {
        serde_yaml::from_str(contents).map_err(|e| {
            VaultsmithError::configuration("config", format!("Failed to parse YAML: {}", e))
        })
    }

    pub fn from_toml_str(contents: &str) -> VaultsmithResult<Self> {
        toml::from_str(contents).map_err(|e| {
            VaultsmithError::configuration("config", format!("Failed to parse TOML: {}", e))
        })
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("VAULTSMITH_TMP_DIR") {
            self.tmp_dir_path = PathBuf::from(dir);
        }

        match &mut self.storage {
            StorageConfig::Local(local) => {
                if let Ok(path) = std::env::var("VAULTSMITH_STORAGE_PATH") {
                    local.path = PathBuf::from(path);
                }
            }
            StorageConfig::S3(s3) => {
                if let Ok(bucket) = std::env::var("VAULTSMITH_S3_BUCKET") {
                    s3.bucket = bucket;
                }
                if let Ok(endpoint) = std::env::var("VAULTSMITH_S3_ENDPOINT") {
                    s3.endpoint_url = endpoint;
                }
                if let Ok(key_id) = std::env::var("VAULTSMITH_S3_ACCESS_KEY_ID") {
                    s3.access_key_id = Secret::new(key_id);
                }
                if let Ok(secret) = std::env::var("VAULTSMITH_S3_SECRET_ACCESS_KEY") {
                    s3.secret_access_key = Secret::new(secret);
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> VaultsmithResult<()> {
        if !self.tmp_dir_path.is_absolute() {
            return Err(VaultsmithError::configuration(
                "tmp_dir_path",
                format!("{} must be an absolute path", self.tmp_dir_path.display()),
            ));
        }
        if let Some(config_dir) = &self.config_dir_path {
            if !config_dir.is_absolute() {
                return Err(VaultsmithError::configuration(
                    "config_dir_path",
                    format!("{} must be an absolute path", config_dir.display()),
                ));
            }
            if config_dir == &self.tmp_dir_path {
                return Err(VaultsmithError::configuration(
                    "tmp_dir_path",
                    "must differ from the configuration directory",
                ));
            }
        }
        if let Some(terraform_dir) = &self.terraform_dir {
            if !terraform_dir.is_absolute() {
                return Err(VaultsmithError::configuration(
                    "terraform_dir",
                    format!("{} must be an absolute path", terraform_dir.display()),
                ));
            }
        }
        if let StorageConfig::Local(local) = &self.storage {
            if !local.path.is_absolute() {
                return Err(VaultsmithError::configuration(
                    "storage.path",
                    format!("{} must be an absolute path", local.path.display()),
                ));
            }
        }
        if self.orchestration.attempts == 0 {
            return Err(VaultsmithError::configuration(
                "orchestration.attempts",
                "at least one attempt is required",
            ));
        }
        if let Some(vault_config) = &self.vault_config {
            vault_config.validate()?;
        }
        Ok(())
    }

    /// Create the scratch directory
    pub fn prepare_tmp_dir(&self) -> VaultsmithResult<()> {
        fs::create_dir_all(&self.tmp_dir_path).map_err(|e| {
            VaultsmithError::configuration(
                "tmp_dir_path",
                format!("cannot create {}: {}", self.tmp_dir_path.display(), e),
            )
        })
    }
}

impl VaultConfig {
    pub fn from_yaml_slice(bytes: &[u8]) -> VaultsmithResult<Self> {
        let config: VaultConfig = serde_yaml::from_slice(bytes).map_err(|e| {
            VaultsmithError::configuration("vault_config", format!("Failed to parse YAML: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VaultsmithResult<()> {
        let secrets = &self.vault_secrets;
        if secrets.vault_ha_hostname.is_empty() {
            return Err(VaultsmithError::configuration(
                "vault_secrets.vault_ha_hostname",
                "must not be empty",
            ));
        }
        let admin = &secrets.vault_admin_userpass_details;
        if admin.vault_admin_user.is_empty() || admin.vault_admin_password.is_empty() {
            return Err(VaultsmithError::configuration(
                "vault_secrets.vault_admin_userpass_details",
                "admin user and password are required",
            ));
        }
        if admin.vault_admin_userpass_mount_path.trim_matches('/').is_empty() {
            return Err(VaultsmithError::configuration(
                "vault_secrets.vault_admin_userpass_details.vault_admin_userpass_mount_path",
                "must not be empty",
            ));
        }
        Ok(())
    }
}

//! Hand-off to the infrastructure-as-code collaborator
//!
//! The collaborator (Terraform in production) runs against a local state
//! file. Stored state is restored before the run and saved back after a
//! successful one, so the storage backend stays the single source of truth.

use crate::error::{VaultsmithError, VaultsmithResult};
use crate::ha_client::HaClient;
use crate::pki::{write_private_file, write_public_file};
use crate::storage::ClusterStore;
use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

pub const STATE_FILE: &str = "terraform.tfstate";
pub const BACKEND_VARS_FILE: &str = "backend.auto.tfvars.json";
pub const SECRET_VARS_FILE: &str = "secrets.auto.tfvars.json";

/// What the collaborator is asked to apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraRequest {
    pub working_dir: PathBuf,
    /// JSON backend configuration, `{"path": <state file>}`
    pub backend_config_file: PathBuf,
    /// JSON variables with the admin client's connection settings
    pub var_file: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct InfraOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl InfraOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait InfraApplier: Send + Sync {
    async fn apply(&self, request: &InfraRequest) -> VaultsmithResult<InfraOutcome>;
}

async fn remove_local_plugins(terraform_dir: &Path) -> VaultsmithResult<()> {
    let plugins = terraform_dir.join(".terraform");
    if fs::metadata(&plugins).await.is_ok() {
        debug!("Removing {}", plugins.display());
        fs::remove_dir_all(&plugins)
            .await
            .map_err(|e| VaultsmithError::io(format!("remove {}", plugins.display()), e))?;
    }
    Ok(())
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Run the collaborator against `terraform_dir`; a no-op when none is configured
pub async fn apply_infrastructure(
    terraform_dir: Option<&Path>,
    tmp_dir: &Path,
    store: &ClusterStore,
    ha: &HaClient,
    applier: &dyn InfraApplier,
) -> VaultsmithResult<()> {
    let Some(terraform_dir) = terraform_dir else {
        info!("No terraform_dir configured, skipping infrastructure apply");
        return Ok(());
    };
    remove_local_plugins(terraform_dir).await?;

    let state_file = tmp_dir.join(STATE_FILE);
    match store.terraform_state().await? {
        Some(state) => {
            debug!("Restoring stored terraform state to {}", state_file.display());
            write_private_file(&state_file, &state).await?;
        }
        None => {
            if fs::metadata(&state_file).await.is_ok() {
                warn!("Removing stale local state {}", state_file.display());
                fs::remove_file(&state_file)
                    .await
                    .map_err(|e| VaultsmithError::io(format!("remove {}", state_file.display()), e))?;
            }
        }
    }

    let backend_config_file = tmp_dir.join(BACKEND_VARS_FILE);
    let backend = json!({ "path": display(&state_file) });
    write_public_file(&backend_config_file, serde_json::to_string_pretty(&backend)?.as_bytes()).await?;

    let artifacts = ha.artifacts();
    let var_file = tmp_dir.join(SECRET_VARS_FILE);
    let vars = json!({
        "codifiedvault_vault_fqdn": ha.hostname(),
        "codifiedvault_vault_port": ha.port(),
        "codifiedvault_login_username": ha.username(),
        "codifiedvault_login_userpass_mount_path": ha.userpass_mount(),
        "codifiedvault_login_password": ha.password().expose(),
        "codifiedvault_vault_client_key_file": display(&artifacts.client_key_file),
        "codifiedvault_vault_client_cert_file": display(&artifacts.client_cert_file),
        "codifiedvault_vault_ca_file": display(&artifacts.root_ca_file),
    });
    write_private_file(&var_file, serde_json::to_string_pretty(&vars)?.as_bytes()).await?;
    info!("Wrote {} and {}", backend_config_file.display(), var_file.display());

    let request = InfraRequest {
        working_dir: terraform_dir.to_path_buf(),
        backend_config_file,
        var_file,
    };
    let outcome = applier.apply(&request).await?;
    debug!("Infrastructure apply stdout: {}", outcome.stdout);
    remove_local_plugins(terraform_dir).await?;

    if !outcome.success() {
        return Err(VaultsmithError::orchestration(
            "infra",
            format!(
                "apply exited with {}: {}",
                outcome.exit_code,
                outcome.stderr.trim()
            ),
        ));
    }

    let state = fs::read(&state_file)
        .await
        .map_err(|e| VaultsmithError::io(format!("read {}", state_file.display()), e))?;
    store.save_terraform_state(&state).await?;

    let backup = tmp_dir.join(format!("{}_bak_{}", STATE_FILE, chrono::Utc::now().timestamp()));
    fs::rename(&state_file, &backup)
        .await
        .map_err(|e| VaultsmithError::io(format!("move {} aside", state_file.display()), e))?;
    info!("Saved terraform state; local copy moved to {}", backup.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::test_support::Harness;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    /// Writes a state file and records what it saw
    struct FakeApplier {
        exit_code: i32,
        seen_state: Mutex<Option<String>>,
        seen_vars: Mutex<Option<serde_json::Value>>,
    }

    impl FakeApplier {
        fn new(exit_code: i32) -> Self {
            Self {
                exit_code,
                seen_state: Mutex::new(None),
                seen_vars: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl InfraApplier for FakeApplier {
        async fn apply(&self, request: &InfraRequest) -> VaultsmithResult<InfraOutcome> {
            let backend: serde_json::Value =
                serde_json::from_slice(&std::fs::read(&request.backend_config_file).unwrap()).unwrap();
            let state_path = PathBuf::from(backend["path"].as_str().unwrap());
            *self.seen_state.lock() = std::fs::read_to_string(&state_path).ok();
            *self.seen_vars.lock() =
                Some(serde_json::from_slice(&std::fs::read(&request.var_file).unwrap()).unwrap());
            std::fs::write(&state_path, br#"{"version":4,"serial":2}"#).unwrap();
            Ok(InfraOutcome {
                exit_code: self.exit_code,
                stderr: if self.exit_code == 0 { String::new() } else { "boom".to_string() },
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn skipped_without_terraform_dir() {
        let harness = Harness::new(1).await;
        let ha = harness.ha_client().await;
        let applier = FakeApplier::new(0);
        apply_infrastructure(None, harness.tmp.path(), &harness.store, &ha, &applier)
            .await
            .unwrap();
        assert!(applier.seen_vars.lock().is_none());
    }

    #[tokio::test]
    async fn restores_and_saves_state() {
        let harness = Harness::new(1).await;
        let ha = harness.ha_client().await;
        let terraform_dir = harness.tmp.path().join("codifiedvault");
        std::fs::create_dir_all(terraform_dir.join(".terraform")).unwrap();
        harness
            .store
            .save_terraform_state(br#"{"version":4,"serial":1}"#)
            .await
            .unwrap();
        let applier = FakeApplier::new(0);

        apply_infrastructure(Some(&terraform_dir), harness.tmp.path(), &harness.store, &ha, &applier)
            .await
            .unwrap();

        assert_eq!(
            applier.seen_state.lock().as_deref(),
            Some(r#"{"version":4,"serial":1}"#)
        );
        let vars = applier.seen_vars.lock().clone().unwrap();
        assert_eq!(vars["codifiedvault_vault_fqdn"], "vault.example.com");
        assert_eq!(vars["codifiedvault_vault_port"], 8200);
        assert_eq!(vars["codifiedvault_login_password"], "correct horse");

        assert_eq!(
            harness.store.terraform_state().await.unwrap().unwrap(),
            br#"{"version":4,"serial":2}"#.to_vec()
        );
        assert!(!harness.tmp.path().join(STATE_FILE).exists());
        assert!(!terraform_dir.join(".terraform").exists());
        let backups = std::fs::read_dir(harness.tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("terraform.tfstate_bak_"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn failed_apply_is_retryable_and_keeps_stored_state() {
        let harness = Harness::new(1).await;
        let ha = harness.ha_client().await;
        let terraform_dir = harness.tmp.path().join("codifiedvault");
        std::fs::create_dir_all(&terraform_dir).unwrap();
        let applier = FakeApplier::new(1);

        let err = apply_infrastructure(Some(&terraform_dir), harness.tmp.path(), &harness.store, &ha, &applier)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("infra"));
        assert!(harness.store.terraform_state().await.unwrap().is_none());
    }
}

//! Terraform as the infrastructure collaborator

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};
use vaultsmith_core::{InfraApplier, InfraOutcome, InfraRequest, VaultsmithError, VaultsmithResult};

pub struct TerraformApplier {
    binary: PathBuf,
}

impl TerraformApplier {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    async fn terraform(&self, working_dir: &Path, args: &[String]) -> VaultsmithResult<InfraOutcome> {
        let mut full_args = vec![format!("-chdir={}", working_dir.display())];
        full_args.extend_from_slice(args);
        info!("Running {} {}", self.binary.display(), full_args.join(" "));

        let output = Command::new(&self.binary)
            .args(&full_args)
            .env("TF_IN_AUTOMATION", "1")
            .output()
            .await
            .map_err(|e| VaultsmithError::io(format!("run {}", self.binary.display()), e))?;

        let outcome = InfraOutcome {
            // A signal-terminated process has no exit code
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("terraform exited with {}", outcome.exit_code);
        Ok(outcome)
    }
}

#[async_trait]
impl InfraApplier for TerraformApplier {
    async fn apply(&self, request: &InfraRequest) -> VaultsmithResult<InfraOutcome> {
        let init = self
            .terraform(
                &request.working_dir,
                &[
                    "init".to_string(),
                    "-input=false".to_string(),
                    format!("-backend-config={}", request.backend_config_file.display()),
                ],
            )
            .await?;
        if !init.success() {
            return Ok(init);
        }

        self.terraform(
            &request.working_dir,
            &[
                "apply".to_string(),
                "-input=false".to_string(),
                "-auto-approve".to_string(),
                format!("-var-file={}", request.var_file.display()),
            ],
        )
        .await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_terraform(dir: &Path, init_exit: i32) -> PathBuf {
        let script = dir.join("terraform");
        let log = dir.join("calls.log");
        let body = format!(
            "#!/bin/sh\necho \"$@\" >> {log}\ncase \"$2\" in init) exit {init_exit};; esac\necho applied\n",
            log = log.display(),
            init_exit = init_exit,
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn request(dir: &Path) -> InfraRequest {
        InfraRequest {
            working_dir: dir.join("tf"),
            backend_config_file: dir.join("backend.tfvars"),
            var_file: dir.join("secrets.tfvars"),
        }
    }

    #[tokio::test]
    async fn test_init_then_apply() {
        let dir = TempDir::new().unwrap();
        let applier = TerraformApplier::new(fake_terraform(dir.path(), 0));

        let outcome = applier.apply(&request(dir.path())).await.unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout.trim(), "applied");

        let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("init -input=false -backend-config="));
        assert!(calls[1].contains("apply -input=false -auto-approve -var-file="));
        assert!(calls[1].starts_with(&format!("-chdir={}", dir.path().join("tf").display())));
    }

    #[tokio::test]
    async fn test_failed_init_skips_apply() {
        let dir = TempDir::new().unwrap();
        let applier = TerraformApplier::new(fake_terraform(dir.path(), 3));

        let outcome = applier.apply(&request(dir.path())).await.unwrap();
        assert_eq!(outcome.exit_code, 3);

        let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert_eq!(calls.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let dir = TempDir::new().unwrap();
        let applier = TerraformApplier::new(dir.path().join("absent"));
        assert!(applier.apply(&request(dir.path())).await.is_err());
    }
}

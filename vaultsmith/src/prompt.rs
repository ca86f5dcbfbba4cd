//! Terminal prompt for first-time initialization

use async_trait::async_trait;
use dialoguer::{Confirm, Input};
use std::io;
use vaultsmith_core::{OperatorPrompt, VaultsmithError, VaultsmithResult};

const DEFAULT_KEY_SHARES: u32 = 5;
const DEFAULT_KEY_THRESHOLD: u32 = 3;

/// Ctrl-C while reading input is an interrupt, anything else means nobody can answer
fn prompt_error(e: dialoguer::Error) -> VaultsmithError {
    match e {
        dialoguer::Error::IO(source) if source.kind() == io::ErrorKind::Interrupted => {
            VaultsmithError::Interrupted
        }
        other => VaultsmithError::operator_input(other.to_string()),
    }
}

/// Run a blocking dialoguer interaction off the async workers
async fn ask<T, F>(question: F) -> VaultsmithResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, dialoguer::Error> + Send + 'static,
{
    tokio::task::spawn_blocking(question).await?.map_err(prompt_error)
}

pub struct TerminalPrompt;

#[async_trait]
impl OperatorPrompt for TerminalPrompt {
    async fn confirm_initialize(&self) -> VaultsmithResult<bool> {
        ask(|| {
            Confirm::new()
                .with_prompt("No Vault node is initialized. Initialize a new cluster?")
                .default(false)
                .interact()
        })
        .await
    }

    async fn key_shares_and_threshold(&self) -> VaultsmithResult<(u32, u32)> {
        let shares: u32 = ask(|| {
            Input::new()
                .with_prompt("Number of unseal key shares")
                .default(DEFAULT_KEY_SHARES)
                .interact_text()
        })
        .await?;
        let threshold: u32 = ask(move || {
            Input::new()
                .with_prompt("Number of key shares required to unseal")
                .default(DEFAULT_KEY_THRESHOLD.min(shares))
                .interact_text()
        })
        .await?;
        Ok((shares, threshold))
    }
}

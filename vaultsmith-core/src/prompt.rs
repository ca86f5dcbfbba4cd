//! Operator interaction during first initialization
//!
//! Initializing a cluster is irreversible, so the orchestrator asks before
//! doing it. The question is behind a trait so that the CLI can prompt on a
//! terminal while tests script the answers.

use crate::error::VaultsmithResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Questions asked before initializing a cluster
///
/// Implementations that wait on a terminal must not block the runtime, so
/// that an interrupt racing the run can still be observed.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Ask whether a brand-new cluster should be initialized
    async fn confirm_initialize(&self) -> VaultsmithResult<bool>;

    /// Ask for `(secret_shares, secret_threshold)`
    async fn key_shares_and_threshold(&self) -> VaultsmithResult<(u32, u32)>;
}

/// Fixed answers, for tests and non-interactive runs
#[derive(Debug)]
pub struct ScriptedPrompt {
    confirm: bool,
    shares: u32,
    threshold: u32,
    asked: AtomicUsize,
}

impl ScriptedPrompt {
    pub fn new(confirm: bool, shares: u32, threshold: u32) -> Self {
        Self {
            confirm,
            shares,
            threshold,
            asked: AtomicUsize::new(0),
        }
    }

    /// Confirm with the given key split
    pub fn accept(shares: u32, threshold: u32) -> Self {
        Self::new(true, shares, threshold)
    }

    pub fn decline() -> Self {
        Self::new(false, 0, 0)
    }

    /// How many times confirmation was requested
    pub fn times_asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperatorPrompt for ScriptedPrompt {
    async fn confirm_initialize(&self) -> VaultsmithResult<bool> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(self.confirm)
    }

    async fn key_shares_and_threshold(&self) -> VaultsmithResult<(u32, u32)> {
        Ok((self.shares, self.threshold))
    }
}

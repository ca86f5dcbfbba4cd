//! Error handling for vaultsmith
//!
//! Every fallible operation in the crate returns [`VaultsmithResult`]. The
//! orchestration loop never inspects concrete variants to decide whether to
//! try again; it asks the error for its [`ErrorKind`].
//!
//! ## Error Categories
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   Vaultsmith Error Taxonomy                  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Fatal                │  Retryable             │  SafeExit   │
//! │  ┌─────────────────┐  │  ┌──────────────────┐  │  ┌────────┐ │
//! │  │ • Configuration │  │  │ • No ready node  │  │  │ • Op.  │ │
//! │  │ • Inconsistent  │  │  │ • Raft converge  │  │  │   said │ │
//! │  │   run state     │  │  │ • Lost quorum    │  │  │   no   │ │
//! │  │ • Retries spent │  │  │ • Vault / HTTP   │  │  └────────┘ │
//! │  │ • Interrupted   │  │  │ • Storage / IO   │  │             │
//! │  └─────────────────┘  │  └──────────────────┘  │             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Anything that is not explicitly fatal or a safe exit is retryable: the
//! whole pipeline is idempotent, so the outer loop re-runs it from scratch.

pub mod constructors;
pub mod conversions;
pub mod types;

pub use types::{ErrorKind, Result, VaultsmithError, VaultsmithResult};

#[cfg(test)]
mod tests;

//! Orchestration steps, one module per pipeline state
//!
//! Each step is an async free function over the clients and stores it needs.
//! Every step checks the cluster before acting, so re-running the pipeline
//! after a partial failure is safe.
//!
//! ```text
//! initialize → unseal → ready_node → root_token → raft_membership
//!     → admin_user → pki_root → infra → revoke → secrets_sync → snapshot
//! ```

pub mod admin_user;
pub mod infra;
pub mod initialize;
pub mod pki_root;
pub mod raft_membership;
pub mod ready_node;
pub mod revoke;
pub mod root_token;
pub mod secrets_sync;
pub mod snapshot;
pub mod unseal;

#[cfg(test)]
pub(crate) mod test_support;

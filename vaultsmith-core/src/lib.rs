pub mod config;
pub mod error;
pub mod ha_client;
pub mod node_client;
pub mod orchestrator;
pub mod patterns;
pub mod pki;
pub mod prompt;
pub mod steps;
pub mod storage;
pub mod topology;
pub mod types;
pub mod vault_api;

pub use config::{ClusterConfig, VaultConfig, VaultSecrets};
pub use error::{ErrorKind, VaultsmithError, VaultsmithResult};
pub use ha_client::HaClient;
pub use node_client::NodeClient;
pub use orchestrator::{ClusterClients, ClusterOrchestrator};
pub use prompt::{OperatorPrompt, ScriptedPrompt};
pub use steps::infra::{InfraApplier, InfraOutcome, InfraRequest};
pub use storage::ClusterStore;
pub use topology::{RaftNode, Topology};
pub use types::Secret;

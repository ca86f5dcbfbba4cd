//! Request and response shapes of the Vault HTTP API

use crate::types::Secret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of `GET /v1/sys/health`, plus the HTTP status it came with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub initialized: bool,
    pub sealed: bool,
    #[serde(default)]
    pub standby: bool,
    #[serde(skip)]
    pub status_code: u16,
}

impl HealthStatus {
    /// Initialized, unsealed and active
    pub fn is_ready(&self) -> bool {
        (self.initialized && !self.sealed && !self.standby) || self.status_code == 200
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub secret_shares: u32,
    pub secret_threshold: u32,
}

/// Key material returned once by `PUT /v1/sys/init`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResponse {
    pub keys: Vec<Secret>,
    pub keys_base64: Vec<Secret>,
    pub root_token: Secret,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    pub sealed: bool,
    #[serde(rename = "t", default)]
    pub threshold: u32,
    #[serde(rename = "n", default)]
    pub shares: u32,
    #[serde(default)]
    pub progress: u32,
}

/// State of a root token generation attempt
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRootStatus {
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub progress: u32,
    #[serde(default)]
    pub required: u32,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub encoded_token: String,
    #[serde(default)]
    pub encoded_root_token: String,
    /// Only present in the response that starts an attempt
    #[serde(default)]
    pub otp: Secret,
    #[serde(default)]
    pub otp_length: u32,
}

impl GenerateRootStatus {
    pub fn encoded(&self) -> &str {
        if self.encoded_token.is_empty() {
            &self.encoded_root_token
        } else {
            &self.encoded_token
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftServer {
    pub node_id: String,
    /// `host:port` of the cluster listener
    pub address: String,
    #[serde(default)]
    pub leader: bool,
    #[serde(default)]
    pub voter: bool,
}

/// Body of `POST /v1/sys/storage/raft/join`
#[derive(Clone, Serialize, Deserialize)]
pub struct RaftJoinRequest {
    pub leader_api_addr: String,
    pub leader_ca_cert: String,
    pub leader_client_cert: String,
    pub leader_client_key: Secret,
    pub retry: bool,
}

impl std::fmt::Debug for RaftJoinRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftJoinRequest")
            .field("leader_api_addr", &self.leader_api_addr)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

/// Subset of a token lookup response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenInfo {
    pub accessor: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub creation_time: i64,
    #[serde(default)]
    pub expire_time: Option<String>,
}

/// Entry of `sys/auth` or `sys/mounts`, keyed by path with a trailing slash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub description: String,
}

pub type MountTable = BTreeMap<String, MountInfo>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountTune {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_lease_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_lease_ttl: Option<String>,
}

/// Body of `POST /v1/auth/<mount>/users/<name>`
#[derive(Clone, Serialize, Deserialize)]
pub struct UserpassUser {
    pub password: Secret,
    pub token_policies: Vec<String>,
    pub token_ttl: String,
}

impl std::fmt::Debug for UserpassUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserpassUser")
            .field("token_policies", &self.token_policies)
            .field("token_ttl", &self.token_ttl)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerInfo {
    #[serde(default)]
    pub issuer_name: String,
    /// Colon-separated lowercase hex, as Vault reports it
    pub serial_number: String,
}

/// Compare certificate serials regardless of separators, case and leading zeros
pub fn serials_match(left: &str, right: &str) -> bool {
    fn normalize(serial: &str) -> String {
        let hex: String = serial
            .chars()
            .filter(|c| *c != ':')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        hex.trim_start_matches('0').to_string()
    }
    normalize(left) == normalize(right)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_readiness() {
        let standby = HealthStatus {
            initialized: true,
            sealed: false,
            standby: true,
            status_code: 429,
        };
        assert!(!standby.is_ready());

        let active = HealthStatus {
            standby: false,
            status_code: 200,
            ..standby.clone()
        };
        assert!(active.is_ready());

        let sealed = HealthStatus {
            initialized: true,
            sealed: true,
            standby: true,
            status_code: 503,
        };
        assert!(!sealed.is_ready());
    }

    #[test]
    fn serial_normalization() {
        assert!(serials_match("0a:1b:ff", "A1BFF"));
        assert!(serials_match("7D:00", "7d00"));
        assert!(!serials_match("7d:00", "7d01"));
    }

    #[test]
    fn generate_root_status_accepts_either_token_field() {
        let status: GenerateRootStatus =
            serde_json::from_str(r#"{"started":true,"progress":1,"required":1,"complete":true,"encoded_token":"abc"}"#)
                .unwrap();
        assert_eq!(status.encoded(), "abc");
        assert!(status.otp.is_empty());
    }
}

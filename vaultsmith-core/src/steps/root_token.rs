//! Root token regeneration and distribution
//!
//! A new root token is produced with Vault's OTP protocol: start an attempt
//! to receive a one-time pad, submit unseal keys until the threshold is met,
//! then XOR the returned encoded token with the pad.

use crate::error::{VaultsmithError, VaultsmithResult};
use crate::node_client::NodeClient;
use crate::storage::UnsealBundle;
use crate::types::Secret;
use crate::vault_api::{GenerateRootStatus, VaultApi};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use tracing::{debug, info, warn};

const LOST_QUORUM_MARKER: &str = "local node not active but active cluster node not found";

/// Vault returns the encoded token with or without padding depending on version
const TOLERANT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Recover the plaintext root token from its OTP-masked encoding
pub fn decode_root_token(encoded: &str, otp: &Secret) -> VaultsmithResult<Secret> {
    let masked = TOLERANT_BASE64
        .decode(encoded.trim())
        .map_err(|e| VaultsmithError::orchestration("root_token", format!("encoded root token is not base64: {}", e)))?;
    let pad = otp.expose().as_bytes();
    if masked.len() != pad.len() {
        return Err(VaultsmithError::orchestration(
            "root_token",
            format!(
                "encoded root token is {} bytes but the OTP is {} bytes",
                masked.len(),
                pad.len()
            ),
        ));
    }
    let token: Vec<u8> = masked.iter().zip(pad).map(|(m, p)| m ^ p).collect();
    String::from_utf8(token)
        .map(Secret::new)
        .map_err(|_| VaultsmithError::orchestration("root_token", "decoded root token is not UTF-8"))
}

async fn generation_status(api: &dyn VaultApi, node_id: &str) -> VaultsmithResult<GenerateRootStatus> {
    api.generate_root_status().await.map_err(|err| match &err {
        VaultsmithError::VaultApi { status: 500, errors, .. }
            if errors.iter().any(|e| e.contains(LOST_QUORUM_MARKER)) =>
        {
            VaultsmithError::QuorumLost {
                node_id: node_id.to_string(),
                message: errors.join("; "),
            }
        }
        _ => err,
    })
}

/// Generate a fresh root token on `node` with the stored unseal keys
pub async fn generate_root_token(node: &NodeClient, bundle: &UnsealBundle) -> VaultsmithResult<Secret> {
    let api = node.api();
    let status = generation_status(api, node.node_id()).await?;

    let keys = bundle.hex_keys()?;
    if (keys.len() as u32) < status.required {
        return Err(VaultsmithError::orchestration(
            "root_token",
            format!(
                "{} unseal keys stored but {} are required to generate a root token",
                keys.len(),
                status.required
            ),
        ));
    }

    if status.started {
        warn!("Cancelling root token generation already in progress on {}", node.node_id());
        api.generate_root_cancel().await?;
    }

    let attempt = api.generate_root_start().await?;
    debug!("Started root token generation on {}", node.node_id());

    let mut latest = attempt.clone();
    for key in &keys {
        latest = api.generate_root_update(key, &attempt.nonce).await?;
        debug!("Root token generation progress {}/{}", latest.progress, latest.required);
        if latest.complete || latest.progress >= latest.required {
            break;
        }
    }

    if latest.encoded().is_empty() {
        return Err(VaultsmithError::orchestration(
            "root_token",
            format!("{} did not return an encoded root token", node.node_id()),
        ));
    }
    let token = decode_root_token(latest.encoded(), &attempt.otp)?;
    info!("Generated new root token on {}", node.node_id());
    Ok(token)
}

/// Set `token` on every reachable node client and report whether it authenticates
pub async fn broadcast_token(nodes: &[NodeClient], token: &Secret) -> VaultsmithResult<()> {
    for node in nodes {
        let health = match node.api().health().await {
            Ok(health) => health,
            Err(e) => {
                warn!("Cannot read health of {}: {}", node.node_id(), e);
                continue;
            }
        };
        if health.sealed || !health.initialized {
            info!("Not setting token on {}: sealed or not initialized", node.node_id());
            continue;
        }

        node.api().set_token(Some(token.clone()));
        match node.api().is_authenticated().await {
            Ok(true) => info!("Token authenticated on {}", node.node_id()),
            Ok(false) => warn!("Token does not authenticate on {}", node.node_id()),
            Err(e) => warn!("Cannot verify token on {}: {}", node.node_id(), e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::ready_node::find_ready_node;
    use crate::steps::test_support::Harness;
    use pretty_assertions::assert_eq;

    #[test]
    fn decodes_known_vector() {
        let otp = Secret::new("wQ3qT9rLmP2xVbN7cK8sHdE1fJ4gY6Z");
        let token = decode_root_token("HydAXxd4Nx8kGko2J1EsYBcZDz8YHnRHLX9ZNjwPOw", &otp).unwrap();
        assert_eq!(token.expose(), "hvs.CAESIJxNq3bWtR7LPz1vK5mQe9a");

        let padded = decode_root_token("HydAXxd4Nx8kGko2J1EsYBcZDz8YHnRHLX9ZNjwPOw==", &otp).unwrap();
        assert_eq!(padded, token);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let err = decode_root_token("HydAXxd4", &Secret::new("short-otp-value")).unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn generated_token_works_on_every_node() {
        let (harness, bundle) = Harness::bootstrapped(3).await;
        for node in &harness.nodes {
            node.api().set_token(None);
        }
        let ready = find_ready_node(&harness.nodes).await.unwrap();

        let token = generate_root_token(ready, &bundle).await.unwrap();
        assert_ne!(token, bundle.root_token);
        assert_eq!(harness.cluster.root_tokens_generated(), 1);

        broadcast_token(&harness.nodes, &token).await.unwrap();
        for node in &harness.nodes {
            assert!(node.api().is_authenticated().await.unwrap());
        }
    }

    #[tokio::test]
    async fn stale_attempt_is_cancelled_first() {
        let (harness, bundle) = Harness::bootstrapped(1).await;
        let ready = find_ready_node(&harness.nodes).await.unwrap();
        ready.api().generate_root_start().await.unwrap();

        let token = generate_root_token(ready, &bundle).await.unwrap();
        assert!(token.expose().starts_with("hvs."));
    }

    #[tokio::test]
    async fn lost_quorum_is_retryable() {
        let (harness, bundle) = Harness::bootstrapped(1).await;
        harness.cluster.set_lost_quorum(true);
        let err = generate_root_token(&harness.nodes[0], &bundle).await.unwrap_err();
        assert!(matches!(err, VaultsmithError::QuorumLost { .. }));
        assert!(err.is_retryable());
    }
}

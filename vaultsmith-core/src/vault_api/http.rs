//! Vault API over HTTPS with mutual TLS

use super::types::{
    GenerateRootStatus, HealthStatus, InitRequest, InitResponse, IssuerInfo, MountTable, MountTune,
    RaftJoinRequest, RaftServer, SealStatus, TokenInfo, UserpassUser,
};
use super::{api_error, VaultApi, VaultApiFactory, VaultEndpoint};
use crate::error::{VaultsmithError, VaultsmithResult};
use crate::patterns::{retry, RetryConfig};
use crate::types::Secret;
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const TOKEN_HEADER: &str = "X-Vault-Token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpVaultApi {
    address: String,
    client: reqwest::Client,
    token: RwLock<Option<Secret>>,
}

impl std::fmt::Debug for HttpVaultApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVaultApi")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl HttpVaultApi {
    /// Client that trusts only the endpoint's CA and presents its client certificate
    pub fn new(endpoint: &VaultEndpoint) -> VaultsmithResult<Self> {
        let identity_pem = format!(
            "{}\n{}",
            endpoint.client_key_pem.expose(),
            endpoint.client_cert_pem
        );
        let identity = reqwest::Identity::from_pem(identity_pem.as_bytes()).map_err(|e| {
            VaultsmithError::configuration("vault client identity", format!("{}: {}", endpoint.url, e))
        })?;
        let ca = reqwest::Certificate::from_pem(endpoint.ca_cert_pem.as_bytes()).map_err(|e| {
            VaultsmithError::configuration("vault CA certificate", format!("{}: {}", endpoint.url, e))
        })?;

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .identity(identity)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| VaultsmithError::transport(endpoint.url.clone(), e))?;

        Ok(Self {
            address: endpoint.url.trim_end_matches('/').to_string(),
            client,
            token: RwLock::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.address, path.trim_start_matches('/'))
    }

    /// Send one request, retrying connection failures
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> VaultsmithResult<(u16, Vec<u8>)> {
        let config = RetryConfig::for_vault_requests(path);
        let url = self.url(path);
        let token = self.token();

        retry(&config, || {
            let mut request = self.client.request(method.clone(), &url);
            if let Some(token) = &token {
                request = request.header(TOKEN_HEADER, token.expose());
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| VaultsmithError::transport(path, e))?;
                let status = response.status().as_u16();
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| VaultsmithError::transport(path, e))?;
                Ok((status, bytes.to_vec()))
            }
        })
        .await
    }

    /// Send and decode a JSON response; `None` for empty 2xx bodies
    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> VaultsmithResult<Option<Value>> {
        debug!("{} {}", method.as_str(), path);
        let (status, bytes) = self.send(method, path, body).await?;
        if !(200..300).contains(&status) {
            return Err(api_error(path, status, &String::from_utf8_lossy(&bytes)));
        }
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn call_as<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<&Value>) -> VaultsmithResult<T> {
        let value = self.call(method, path, body).await?.ok_or_else(|| {
            VaultsmithError::internal(format!("empty response from {}", path))
        })?;
        Ok(serde_json::from_value(value)?)
    }

    async fn data_as<T: DeserializeOwned>(&self, method: Method, path: &str, body: Option<&Value>) -> VaultsmithResult<T> {
        let mut value: Value = self.call_as(method, path, body).await?;
        let data = value
            .get_mut("data")
            .map(Value::take)
            .ok_or_else(|| VaultsmithError::internal(format!("response from {} has no data", path)))?;
        Ok(serde_json::from_value(data)?)
    }

    /// `LIST` a path; a 404 lists as empty
    async fn list_keys(&self, path: &str) -> VaultsmithResult<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct Keys {
            #[serde(default)]
            keys: Vec<String>,
        }

        match self
            .data_as::<Keys>(Method::GET, &format!("{}?list=true", path), None)
            .await
        {
            Ok(keys) => Ok(keys.keys),
            Err(e) if e.vault_status() == Some(404) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, method: Method, path: &str, body: Value) -> VaultsmithResult<()> {
        self.call(method, path, Some(&body)).await.map(|_| ())
    }
}

#[async_trait]
impl VaultApi for HttpVaultApi {
    fn address(&self) -> &str {
        &self.address
    }

    fn token(&self) -> Option<Secret> {
        self.token.read().clone()
    }

    fn set_token(&self, token: Option<Secret>) {
        *self.token.write() = token;
    }

    async fn health(&self) -> VaultsmithResult<HealthStatus> {
        // Non-200 codes encode standby/sealed/uninitialized; the body is always present
        let (status, bytes) = self.send(Method::GET, "sys/health", None).await?;
        let mut health: HealthStatus = serde_json::from_slice(&bytes)
            .map_err(|_| api_error("sys/health", status, &String::from_utf8_lossy(&bytes)))?;
        health.status_code = status;
        Ok(health)
    }

    async fn is_initialized(&self) -> VaultsmithResult<bool> {
        let value: Value = self.call_as(Method::GET, "sys/init", None).await?;
        Ok(value.get("initialized").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn initialize(&self, request: &InitRequest) -> VaultsmithResult<InitResponse> {
        self.call_as(Method::PUT, "sys/init", Some(&serde_json::to_value(request)?))
            .await
    }

    async fn unseal(&self, key: &Secret) -> VaultsmithResult<SealStatus> {
        self.call_as(Method::PUT, "sys/unseal", Some(&json!({ "key": key })))
            .await
    }

    async fn generate_root_status(&self) -> VaultsmithResult<GenerateRootStatus> {
        self.call_as(Method::GET, "sys/generate-root/attempt", None).await
    }

    async fn generate_root_start(&self) -> VaultsmithResult<GenerateRootStatus> {
        self.call_as(Method::PUT, "sys/generate-root/attempt", Some(&json!({})))
            .await
    }

    async fn generate_root_cancel(&self) -> VaultsmithResult<()> {
        self.call(Method::DELETE, "sys/generate-root/attempt", None)
            .await
            .map(|_| ())
    }

    async fn generate_root_update(&self, key: &Secret, nonce: &str) -> VaultsmithResult<GenerateRootStatus> {
        self.call_as(
            Method::PUT,
            "sys/generate-root/update",
            Some(&json!({ "key": key, "nonce": nonce })),
        )
        .await
    }

    async fn raft_configuration(&self) -> VaultsmithResult<Vec<RaftServer>> {
        let data: Value = self
            .data_as(Method::GET, "sys/storage/raft/configuration", None)
            .await?;
        let servers = data
            .get("config")
            .and_then(|config| config.get("servers"))
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        Ok(serde_json::from_value(servers)?)
    }

    async fn raft_join(&self, request: &RaftJoinRequest) -> VaultsmithResult<bool> {
        let value: Value = self
            .call_as(
                Method::POST,
                "sys/storage/raft/join",
                Some(&serde_json::to_value(request)?),
            )
            .await?;
        Ok(value.get("joined").and_then(Value::as_bool).unwrap_or(false))
    }

    async fn raft_remove_peer(&self, node_id: &str) -> VaultsmithResult<()> {
        self.write(
            Method::POST,
            "sys/storage/raft/remove-peer",
            json!({ "server_id": node_id }),
        )
        .await
    }

    async fn raft_snapshot(&self) -> VaultsmithResult<Vec<u8>> {
        let path = "sys/storage/raft/snapshot";
        let (status, bytes) = self.send(Method::GET, path, None).await?;
        if status != 200 {
            return Err(api_error(path, status, &String::from_utf8_lossy(&bytes)));
        }
        Ok(bytes)
    }

    async fn lookup_self(&self) -> VaultsmithResult<TokenInfo> {
        self.data_as(Method::GET, "auth/token/lookup-self", None).await
    }

    async fn list_token_accessors(&self) -> VaultsmithResult<Vec<String>> {
        self.list_keys("auth/token/accessors").await
    }

    async fn lookup_accessor(&self, accessor: &str) -> VaultsmithResult<TokenInfo> {
        self.data_as(
            Method::POST,
            "auth/token/lookup-accessor",
            Some(&json!({ "accessor": accessor })),
        )
        .await
    }

    async fn revoke_accessor(&self, accessor: &str) -> VaultsmithResult<()> {
        self.write(
            Method::POST,
            "auth/token/revoke-accessor",
            json!({ "accessor": accessor }),
        )
        .await
    }

    async fn revoke_self(&self) -> VaultsmithResult<()> {
        self.call(Method::POST, "auth/token/revoke-self", None).await?;
        self.set_token(None);
        Ok(())
    }

    async fn userpass_login(&self, mount: &str, username: &str, password: &Secret) -> VaultsmithResult<Secret> {
        let path = format!("auth/{}/login/{}", mount, username);
        let value: Value = self
            .call_as(Method::POST, &path, Some(&json!({ "password": password })))
            .await?;
        let token = value
            .get("auth")
            .and_then(|auth| auth.get("client_token"))
            .and_then(Value::as_str)
            .ok_or(VaultsmithError::Unauthenticated { endpoint: path })?;
        let token = Secret::new(token);
        self.set_token(Some(token.clone()));
        Ok(token)
    }

    async fn put_policy(&self, name: &str, policy: &str) -> VaultsmithResult<()> {
        self.write(
            Method::PUT,
            &format!("sys/policies/acl/{}", name),
            json!({ "policy": policy }),
        )
        .await
    }

    async fn list_auth_methods(&self) -> VaultsmithResult<MountTable> {
        self.data_as(Method::GET, "sys/auth", None).await
    }

    async fn enable_auth_method(&self, path: &str, kind: &str) -> VaultsmithResult<()> {
        self.write(Method::POST, &format!("sys/auth/{}", path), json!({ "type": kind }))
            .await
    }

    async fn tune_auth_method(&self, path: &str, tune: &MountTune) -> VaultsmithResult<()> {
        self.write(
            Method::POST,
            &format!("sys/auth/{}/tune", path),
            serde_json::to_value(tune)?,
        )
        .await
    }

    async fn write_userpass_user(&self, mount: &str, username: &str, user: &UserpassUser) -> VaultsmithResult<()> {
        self.write(
            Method::POST,
            &format!("auth/{}/users/{}", mount, username),
            serde_json::to_value(user)?,
        )
        .await
    }

    async fn list_approle_roles(&self, mount: &str) -> VaultsmithResult<Vec<String>> {
        self.list_keys(&format!("auth/{}/role", mount)).await
    }

    async fn list_secret_id_accessors(&self, mount: &str, role: &str) -> VaultsmithResult<Vec<String>> {
        self.list_keys(&format!("auth/{}/role/{}/secret-id", mount, role))
            .await
    }

    async fn destroy_secret_id_accessor(&self, mount: &str, role: &str, accessor: &str) -> VaultsmithResult<()> {
        self.write(
            Method::POST,
            &format!("auth/{}/role/{}/secret-id-accessor/destroy", mount, role),
            json!({ "secret_id_accessor": accessor }),
        )
        .await
    }

    async fn list_mounts(&self) -> VaultsmithResult<MountTable> {
        self.data_as(Method::GET, "sys/mounts", None).await
    }

    async fn enable_secrets_engine(&self, path: &str, kind: &str, tune: &MountTune) -> VaultsmithResult<()> {
        self.write(
            Method::POST,
            &format!("sys/mounts/{}", path),
            json!({ "type": kind, "config": tune }),
        )
        .await
    }

    async fn tune_mount(&self, path: &str, tune: &MountTune) -> VaultsmithResult<()> {
        self.write(
            Method::POST,
            &format!("sys/mounts/{}/tune", path),
            serde_json::to_value(tune)?,
        )
        .await
    }

    async fn pki_submit_ca(&self, mount: &str, pem_bundle: &Secret) -> VaultsmithResult<()> {
        self.write(
            Method::POST,
            &format!("{}/config/ca", mount),
            json!({ "pem_bundle": pem_bundle }),
        )
        .await
    }

    async fn pki_list_issuers(&self, mount: &str) -> VaultsmithResult<BTreeMap<String, IssuerInfo>> {
        #[derive(serde::Deserialize)]
        struct Issuers {
            #[serde(default)]
            key_info: BTreeMap<String, IssuerInfo>,
        }

        match self
            .data_as::<Issuers>(Method::GET, &format!("{}/issuers?list=true", mount), None)
            .await
        {
            Ok(issuers) => Ok(issuers.key_info),
            Err(e) if e.vault_status() == Some(404) => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    async fn pki_set_default_issuer(&self, mount: &str, issuer_ref: &str) -> VaultsmithResult<()> {
        self.write(
            Method::POST,
            &format!("{}/config/issuers", mount),
            json!({ "default": issuer_ref, "default_follows_latest_issuer": true }),
        )
        .await
    }

    async fn pki_delete_issuer(&self, mount: &str, issuer_ref: &str) -> VaultsmithResult<()> {
        self.call(Method::DELETE, &format!("{}/issuer/{}", mount, issuer_ref), None)
            .await
            .map(|_| ())
    }

    async fn pki_name_issuer(&self, mount: &str, issuer_ref: &str, name: &str) -> VaultsmithResult<()> {
        self.write(
            Method::POST,
            &format!("{}/issuer/{}", mount, issuer_ref),
            json!({ "issuer_name": name }),
        )
        .await
    }

    async fn kv2_write(&self, mount: &str, path: &str, data: &Map<String, Value>) -> VaultsmithResult<()> {
        self.write(
            Method::POST,
            &format!("{}/data/{}", mount, path),
            json!({ "data": data }),
        )
        .await
    }

    async fn kv2_list(&self, mount: &str, path: &str) -> VaultsmithResult<Vec<String>> {
        self.list_keys(&format!("{}/metadata/{}", mount, path)).await
    }

    async fn kv2_delete_metadata(&self, mount: &str, path: &str) -> VaultsmithResult<()> {
        self.call(Method::DELETE, &format!("{}/metadata/{}", mount, path), None)
            .await
            .map(|_| ())
    }
}

/// Builds [`HttpVaultApi`] clients
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpVaultApiFactory;

impl VaultApiFactory for HttpVaultApiFactory {
    fn connect(&self, endpoint: &VaultEndpoint) -> VaultsmithResult<Arc<dyn VaultApi>> {
        Ok(Arc::new(HttpVaultApi::new(endpoint)?))
    }
}

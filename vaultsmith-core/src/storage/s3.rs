//! S3-compatible storage backend with SSE-C encryption

use super::sigv4::{self, Credentials, SignableRequest};
use super::{ObjectVersion, StorageBackend};
use crate::error::{VaultsmithError, VaultsmithResult};
use crate::types::Secret;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};
use url::Url;

const SSE_ALGORITHM: &str = "AES256";
const SSE_KEY_LEN: usize = 32;

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StorageConfig {
    /// Endpoint such as `https://s3.eu-west-1.amazonaws.com` or a MinIO URL
    pub endpoint_url: String,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key_id: Secret,
    pub secret_access_key: Secret,
    /// Base64 encoding of the 32 byte customer key used for SSE-C
    pub sse_customer_key_base64: Secret,
    /// Also require the bucket to live in `region`
    #[serde(default)]
    pub verify_region: bool,
}

/// Objects in a versioned bucket, encrypted with a customer supplied key
pub struct S3Storage {
    config: S3StorageConfig,
    endpoint: Url,
    sse_key: Vec<u8>,
    client: reqwest::Client,
}

impl S3Storage {
    /// Build the backend without touching the network
    pub fn new(config: S3StorageConfig) -> VaultsmithResult<Self> {
        let endpoint = Url::parse(&config.endpoint_url).map_err(|e| {
            VaultsmithError::configuration(
                "storage.endpoint_url",
                format!("'{}' is not a valid URL: {}", config.endpoint_url, e),
            )
        })?;
        if endpoint.host_str().is_none() {
            return Err(VaultsmithError::configuration(
                "storage.endpoint_url",
                format!("'{}' has no host", config.endpoint_url),
            ));
        }
        if config.bucket.is_empty() {
            return Err(VaultsmithError::configuration("storage.bucket", "bucket name is empty"));
        }

        let sse_key = BASE64
            .decode(config.sse_customer_key_base64.expose().trim())
            .map_err(|e| {
                VaultsmithError::configuration(
                    "storage.sse_customer_key_base64",
                    format!("not valid base64: {}", e),
                )
            })?;
        if sse_key.len() != SSE_KEY_LEN {
            return Err(VaultsmithError::configuration(
                "storage.sse_customer_key_base64",
                format!("key must be {} bytes, got {}", SSE_KEY_LEN, sse_key.len()),
            ));
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| VaultsmithError::storage("build S3 HTTP client", e))?;

        Ok(Self {
            config,
            endpoint,
            sse_key,
            client,
        })
    }

    /// Build the backend and verify the bucket is usable
    pub async fn connect(config: S3StorageConfig) -> VaultsmithResult<Self> {
        let storage = Self::new(config)?;
        storage.verify_bucket().await?;
        Ok(storage)
    }

    async fn verify_bucket(&self) -> VaultsmithResult<()> {
        let bucket = &self.config.bucket;

        let body = self.bucket_subresource("versioning").await?;
        let status = xml_tag_value(&body, "Status");
        if status.as_deref() != Some("Enabled") {
            return Err(VaultsmithError::configuration(
                "storage.bucket",
                format!(
                    "versioning is not enabled on bucket {} (status: {})",
                    bucket,
                    status.as_deref().unwrap_or("never enabled")
                ),
            ));
        }

        if self.config.verify_region {
            let body = self.bucket_subresource("location").await?;
            let location = xml_tag_value(&body, "LocationConstraint")
                .filter(|l| !l.is_empty())
                .unwrap_or_else(default_region);
            if location != self.config.region {
                return Err(VaultsmithError::configuration(
                    "storage.region",
                    format!(
                        "bucket {} is in region {}, configured region is {}",
                        bucket, location, self.config.region
                    ),
                ));
            }
        }

        info!("Using S3 bucket {} with versioning enabled", bucket);
        Ok(())
    }

    async fn bucket_subresource(&self, subresource: &str) -> VaultsmithResult<String> {
        let response = self
            .send(Method::GET, None, &[(subresource, "")], Vec::new(), BTreeMap::new())
            .await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| VaultsmithError::storage(format!("read bucket {}", subresource), e))?;
        if !status.is_success() {
            return Err(VaultsmithError::configuration(
                "storage.bucket",
                format!(
                    "cannot read {} of bucket {}: HTTP {} {}",
                    subresource,
                    self.config.bucket,
                    status.as_u16(),
                    xml_tag_value(&body, "Code").unwrap_or_default()
                ),
            ));
        }
        Ok(body)
    }

    fn sse_headers(&self) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert(
            "x-amz-server-side-encryption-customer-algorithm".to_string(),
            SSE_ALGORITHM.to_string(),
        );
        headers.insert(
            "x-amz-server-side-encryption-customer-key".to_string(),
            BASE64.encode(&self.sse_key),
        );
        headers.insert(
            "x-amz-server-side-encryption-customer-key-md5".to_string(),
            BASE64.encode(md5::compute(&self.sse_key).0),
        );
        headers
    }

    fn host_header(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    async fn send(
        &self,
        method: Method,
        key: Option<&str>,
        query: &[(&str, &str)],
        body: Vec<u8>,
        mut headers: BTreeMap<String, String>,
    ) -> VaultsmithResult<reqwest::Response> {
        let mut path = format!("/{}", sigv4::uri_encode(&self.config.bucket, false));
        if let Some(key) = key {
            path.push('/');
            path.push_str(&sigv4::uri_encode(key, true));
        }

        let mut url = self.endpoint.clone();
        url.set_path(&path);
        let query_string = query
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    sigv4::uri_encode(k, false)
                } else {
                    format!("{}={}", sigv4::uri_encode(k, false), sigv4::uri_encode(v, false))
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        url.set_query(if query_string.is_empty() {
            None
        } else {
            Some(&query_string)
        });

        let now = chrono::Utc::now();
        let payload_sha256 = sigv4::sha256_hex(&body);
        headers.insert("host".to_string(), self.host_header());
        headers.insert("x-amz-content-sha256".to_string(), payload_sha256.clone());
        headers.insert("x-amz-date".to_string(), sigv4::amz_date(now));

        let credentials = Credentials {
            access_key_id: self.config.access_key_id.expose(),
            secret_access_key: self.config.secret_access_key.expose(),
            region: &self.config.region,
        };
        let authorization = sigv4::authorization(
            &credentials,
            &SignableRequest {
                method: method.as_str(),
                path: url.path(),
                query,
                headers: &headers,
                payload_sha256: &payload_sha256,
            },
            now,
        )?;

        debug!("S3 {} {}", method.as_str(), path);
        let mut request = self.client.request(method, url.clone());
        for (name, value) in headers.iter().filter(|(name, _)| name.as_str() != "host") {
            request = request.header(name.as_str(), value.as_str());
        }
        request
            .header("authorization", authorization)
            .body(body)
            .send()
            .await
            .map_err(|e| VaultsmithError::storage(format!("S3 request {}", path), e))
    }
}

/// Text content of the first `<tag ...>` element in an XML document
fn xml_tag_value(document: &str, tag: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let mut search_from = 0;
    while let Some(offset) = document[search_from..].find(&open) {
        let start = search_from + offset;
        let after_name = start + open.len();
        let next = document[after_name..].chars().next()?;
        if next != '>' && next != '/' && !next.is_whitespace() {
            search_from = after_name;
            continue;
        }
        let tag_end = after_name + document[after_name..].find('>')?;
        if document[..tag_end].ends_with('/') {
            return Some(String::new());
        }
        let content_start = tag_end + 1;
        let close = format!("</{}>", tag);
        let content_end = content_start + document[content_start..].find(&close)?;
        return Some(document[content_start..content_end].trim().to_string());
    }
    None
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn read(
        &self,
        key: &str,
        error_on_missing_file: bool,
    ) -> VaultsmithResult<Option<Vec<u8>>> {
        let response = self
            .send(Method::GET, Some(key), &[], Vec::new(), self.sse_headers())
            .await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            let code = xml_tag_value(&body, "Code").unwrap_or_default();
            if code == "NoSuchBucket" {
                return Err(VaultsmithError::storage_message(
                    format!("read {}", key),
                    format!("bucket {} does not exist", self.config.bucket),
                ));
            }
            return if error_on_missing_file {
                Err(VaultsmithError::NotFound {
                    key: key.to_string(),
                })
            } else {
                Ok(None)
            };
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VaultsmithError::storage_message(
                format!("read {}", key),
                format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    xml_tag_value(&body, "Code").unwrap_or_default()
                ),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| VaultsmithError::storage(format!("read body of {}", key), e))?;
        debug!("Read {} bytes from s3://{}/{}", bytes.len(), self.config.bucket, key);
        Ok(Some(bytes.to_vec()))
    }

    async fn write(
        &self,
        key: &str,
        content: &[u8],
        content_type: &str,
    ) -> VaultsmithResult<ObjectVersion> {
        let mut headers = self.sse_headers();
        headers.insert("content-type".to_string(), content_type.to_string());
        headers.insert(
            "content-md5".to_string(),
            BASE64.encode(md5::compute(content).0),
        );

        let response = self
            .send(Method::PUT, Some(key), &[], content.to_vec(), headers)
            .await?;
        let status = response.status();
        let version = response
            .headers()
            .get("x-amz-version-id")
            .or_else(|| response.headers().get("etag"))
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VaultsmithError::storage_message(
                format!("write {}", key),
                format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    xml_tag_value(&body, "Code").unwrap_or_default()
                ),
            ));
        }

        let version = version.unwrap_or_else(|| "null".to_string());
        info!(
            "Stored s3://{}/{} ({} bytes, version {})",
            self.config.bucket,
            key,
            content.len(),
            version
        );
        Ok(ObjectVersion(version))
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.config.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(sse_key: &str) -> S3StorageConfig {
        S3StorageConfig {
            endpoint_url: "https://minio.internal:9000".into(),
            bucket: "vault-state".into(),
            region: default_region(),
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "secret".into(),
            sse_customer_key_base64: sse_key.into(),
            verify_region: false,
        }
    }

    #[test]
    fn sse_key_must_be_32_bytes() {
        let short = BASE64.encode([7u8; 16]);
        assert!(matches!(
            S3Storage::new(config(&short)),
            Err(VaultsmithError::Configuration { .. })
        ));
        assert!(S3Storage::new(config("not base64!")).is_err());

        let good = BASE64.encode([7u8; 32]);
        let storage = S3Storage::new(config(&good)).unwrap();
        assert_eq!(storage.host_header(), "minio.internal:9000");

        let headers = storage.sse_headers();
        assert_eq!(
            headers["x-amz-server-side-encryption-customer-key"],
            good
        );
        assert_eq!(
            headers["x-amz-server-side-encryption-customer-key-md5"],
            BASE64.encode(md5::compute([7u8; 32]).0)
        );
    }

    #[test]
    fn parses_bucket_responses() {
        let versioning = r#"<?xml version="1.0" encoding="UTF-8"?>
<VersioningConfiguration xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Status>Enabled</Status></VersioningConfiguration>"#;
        assert_eq!(xml_tag_value(versioning, "Status").as_deref(), Some("Enabled"));

        let never_enabled = r#"<VersioningConfiguration xmlns="http://s3.amazonaws.com/doc/2006-03-01/"/>"#;
        assert_eq!(xml_tag_value(never_enabled, "Status"), None);

        let location = r#"<LocationConstraint xmlns="http://s3.amazonaws.com/doc/2006-03-01/">eu-west-1</LocationConstraint>"#;
        assert_eq!(
            xml_tag_value(location, "LocationConstraint").as_deref(),
            Some("eu-west-1")
        );
        let us_east = r#"<LocationConstraint xmlns="http://s3.amazonaws.com/doc/2006-03-01/"/>"#;
        assert_eq!(xml_tag_value(us_east, "LocationConstraint").as_deref(), Some(""));
    }
}

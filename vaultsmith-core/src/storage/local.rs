//! Local filesystem storage backend

use super::{ObjectVersion, StorageBackend};
use crate::error::{VaultsmithError, VaultsmithResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    /// Absolute directory holding the objects
    pub path: PathBuf,
}

/// Sidecar written next to every object
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ObjectMetadata {
    key: String,
    content_type: String,
    sha256: String,
    generation: u64,
    written_at: DateTime<Utc>,
}

/// Objects stored as plain files under a base directory
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub async fn new(base_path: PathBuf) -> VaultsmithResult<Self> {
        if !base_path.is_absolute() {
            return Err(VaultsmithError::configuration(
                "storage.path",
                format!("{} must be an absolute path", base_path.display()),
            ));
        }

        tokio::fs::create_dir_all(&base_path)
            .await
            .map_err(|e| VaultsmithError::storage("create storage directory", e))?;

        Ok(Self { base_path })
    }

    fn object_path(&self, key: &str) -> VaultsmithResult<PathBuf> {
        let relative = Path::new(key);
        let well_formed = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !well_formed {
            return Err(VaultsmithError::configuration(
                "storage key",
                format!("'{}' is not a relative object key", key),
            ));
        }
        Ok(self.base_path.join(relative))
    }

    fn metadata_path(object_path: &Path) -> PathBuf {
        let mut name = object_path.as_os_str().to_owned();
        name.push(".meta.json");
        PathBuf::from(name)
    }

    async fn previous_generation(metadata_path: &Path) -> u64 {
        match tokio::fs::read(metadata_path).await {
            Ok(bytes) => match serde_json::from_slice::<ObjectMetadata>(&bytes) {
                Ok(metadata) => metadata.generation,
                Err(e) => {
                    warn!("Ignoring unreadable metadata {:?}: {}", metadata_path, e);
                    0
                }
            },
            Err(_) => 0,
        }
    }
}

/// Replace `path` with `content` so that readers see either the old or the
/// new bytes, and the new bytes are on disk before returning.
async fn write_atomically(path: &Path, content: &[u8]) -> VaultsmithResult<()> {
    let parent = path.parent().ok_or_else(|| {
        VaultsmithError::storage_message("write object", format!("{:?} has no parent", path))
    })?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| VaultsmithError::storage(format!("create directory {:?}", parent), e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}.tmp", file_name));

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| VaultsmithError::storage(format!("create {:?}", tmp_path), e))?;
    file.write_all(content)
        .await
        .map_err(|e| VaultsmithError::storage(format!("write {:?}", tmp_path), e))?;
    file.sync_all()
        .await
        .map_err(|e| VaultsmithError::storage(format!("sync {:?}", tmp_path), e))?;
    drop(file);

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| VaultsmithError::storage(format!("rename into {:?}", path), e))?;

    #[cfg(unix)]
    {
        let dir = tokio::fs::File::open(parent)
            .await
            .map_err(|e| VaultsmithError::storage(format!("open directory {:?}", parent), e))?;
        dir.sync_all()
            .await
            .map_err(|e| VaultsmithError::storage(format!("sync directory {:?}", parent), e))?;
    }

    Ok(())
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn read(
        &self,
        key: &str,
        error_on_missing_file: bool,
    ) -> VaultsmithResult<Option<Vec<u8>>> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                debug!("Read {} bytes from {:?}", bytes.len(), path);
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if error_on_missing_file {
                    Err(VaultsmithError::NotFound {
                        key: key.to_string(),
                    })
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(VaultsmithError::storage(format!("read {}", key), e)),
        }
    }

    async fn write(
        &self,
        key: &str,
        content: &[u8],
        content_type: &str,
    ) -> VaultsmithResult<ObjectVersion> {
        let path = self.object_path(key)?;
        let metadata_path = Self::metadata_path(&path);
        let generation = Self::previous_generation(&metadata_path).await + 1;

        write_atomically(&path, content).await?;

        let metadata = ObjectMetadata {
            key: key.to_string(),
            content_type: content_type.to_string(),
            sha256: hex::encode(Sha256::digest(content)),
            generation,
            written_at: Utc::now(),
        };
        let metadata_json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| VaultsmithError::serialization("serialize object metadata", e))?;
        write_atomically(&metadata_path, &metadata_json).await?;

        debug!("Wrote {} ({} bytes, generation {})", key, content.len(), generation);
        Ok(ObjectVersion(generation.to_string()))
    }

    fn describe(&self) -> String {
        format!("local:{}", self.base_path.display())
    }
}

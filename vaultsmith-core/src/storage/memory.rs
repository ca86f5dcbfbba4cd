//! In-process storage backend used by tests

use super::{ObjectVersion, StorageBackend};
use crate::error::{VaultsmithError, VaultsmithResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct StoredObject {
    content: Vec<u8>,
    content_type: String,
    version: u64,
}

/// Keeps objects in a map; nothing survives the process
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Content type recorded by the last write of `key`
    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.lock().get(key).map(|o| o.content_type.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().contains_key(key)
    }

    /// Number of writes performed against `key`
    pub fn version(&self, key: &str) -> u64 {
        self.objects.lock().get(key).map(|o| o.version).unwrap_or(0)
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn read(
        &self,
        key: &str,
        error_on_missing_file: bool,
    ) -> VaultsmithResult<Option<Vec<u8>>> {
        match self.objects.lock().get(key) {
            Some(object) => Ok(Some(object.content.clone())),
            None if error_on_missing_file => Err(VaultsmithError::NotFound {
                key: key.to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn write(
        &self,
        key: &str,
        content: &[u8],
        content_type: &str,
    ) -> VaultsmithResult<ObjectVersion> {
        let mut objects = self.objects.lock();
        let version = objects.get(key).map(|o| o.version).unwrap_or(0) + 1;
        objects.insert(
            key.to_string(),
            StoredObject {
                content: content.to_vec(),
                content_type: content_type.to_string(),
                version,
            },
        );
        Ok(ObjectVersion(version.to_string()))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip() {
        let storage = MemoryStorage::new();
        let snapshot = vec![0u8, 159, 146, 150, 255];

        storage
            .write("vault_raft_snapshot.snap", &snapshot, "application/octet-stream")
            .await
            .unwrap();

        let read = storage.read("vault_raft_snapshot.snap", true).await.unwrap();
        assert_eq!(read, Some(snapshot));
        assert_eq!(
            storage.content_type("vault_raft_snapshot.snap").as_deref(),
            Some("application/octet-stream")
        );
        assert!(storage.read("absent", false).await.unwrap().is_none());
        assert!(storage.read("absent", true).await.is_err());
    }
}

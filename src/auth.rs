//! Bearer api keys. The clear key value is a uuid4 returned exactly once
//! at creation; only its sha256 is stored.

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::ApiKey;

/// Hash a clear api key value for storage or comparison.
pub fn hash_api_key(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Contract for api key persistence and verification.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Create a key with a unique name. Returns the clear key value.
    async fn create(
        &self,
        name: &str,
        description: Option<String>,
        is_admin: bool,
    ) -> CoreResult<String>;

    /// Delete a key by name. Returns false when absent.
    async fn delete(&self, name: &str) -> CoreResult<bool>;

    /// Verify a clear key value, optionally requiring the admin flag.
    async fn verify(&self, api_key: &str, require_admin: bool) -> CoreResult<bool>;

    /// Remove every key.
    async fn reset(&self) -> CoreResult<()>;
}

/// In-memory api key store.
pub struct MemoryApiKeyStore {
    keys: DashMap<String, ApiKey>,
}

impl MemoryApiKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }
}

impl Default for MemoryApiKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ApiKeyStore for MemoryApiKeyStore {
    async fn create(
        &self,
        name: &str,
        description: Option<String>,
        is_admin: bool,
    ) -> CoreResult<String> {
        let clear = Uuid::new_v4().to_string();

        match self.keys.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(CoreError::DuplicateApiKeyName(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(ApiKey {
                    api_key: hash_api_key(&clear),
                    name: name.to_string(),
                    description,
                    is_admin,
                });
                Ok(clear)
            }
        }
    }

    async fn delete(&self, name: &str) -> CoreResult<bool> {
        Ok(self.keys.remove(name).is_some())
    }

    async fn verify(&self, api_key: &str, require_admin: bool) -> CoreResult<bool> {
        let hashed = hash_api_key(api_key);
        Ok(self.keys.iter().any(|entry| {
            entry.api_key == hashed && (!require_admin || entry.is_admin)
        }))
    }

    async fn reset(&self) -> CoreResult<()> {
        self.keys.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_verify() {
        let store = MemoryApiKeyStore::new();
        let clear = store.create("automation", None, false).await.unwrap();

        assert!(store.verify(&clear, false).await.unwrap());
        assert!(!store.verify(&clear, true).await.unwrap());
        assert!(!store.verify("wrong", false).await.unwrap());
    }

    #[tokio::test]
    async fn test_admin_key() {
        let store = MemoryApiKeyStore::new();
        let clear = store
            .create("root", Some("admin key".to_string()), true)
            .await
            .unwrap();
        assert!(store.verify(&clear, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let store = MemoryApiKeyStore::new();
        store.create("automation", None, false).await.unwrap();
        let result = store.create("automation", None, false).await;
        assert!(matches!(result, Err(CoreError::DuplicateApiKeyName(_))));
    }

    #[tokio::test]
    async fn test_delete_revokes() {
        let store = MemoryApiKeyStore::new();
        let clear = store.create("automation", None, false).await.unwrap();
        assert!(store.delete("automation").await.unwrap());
        assert!(!store.delete("automation").await.unwrap());
        assert!(!store.verify(&clear, false).await.unwrap());
    }
}

//! Analysis result cache.
//!
//! Maps the deterministic fingerprint of `(observable identity, module
//! identity + versions)` to a previously produced analysis request. Module
//! types without a `cache_ttl` bypass the cache entirely. Expiry is lazy on
//! read with a sweeper for bulk cleanup.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::models::{AnalysisModuleType, AnalysisRequest, Observable};

/// Derive the cache key for one observable and one module type.
///
/// Returns `None` when the module type is not cachable. The key is stable
/// over the observable identity, the module name and version, and the
/// canonical JSON serialization of the additional cache keys and extended
/// version lists (ordering significant, empty lists canonicalize
/// identically).
pub fn generate_cache_key(
    observable: &Observable,
    module_type: &AnalysisModuleType,
) -> Option<String> {
    module_type.cache_ttl?;

    let payload = serde_json::json!([
        observable.observable_type,
        observable.value,
        module_type.name,
        module_type.version,
        module_type.additional_cache_keys,
        module_type.extended_version,
    ]);

    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    Some(hex::encode(hasher.finalize()))
}

/// Contract for the analysis result cache.
#[async_trait]
pub trait ResultCache: Send + Sync {
    /// Look up a cached result. Expired entries read as absent.
    async fn get(&self, cache_key: &str) -> CoreResult<Option<AnalysisRequest>>;

    /// Store a completed request. Returns the cache key, or `None` when the
    /// request's module type is not cachable. Duplicate puts replace the
    /// prior entry.
    async fn put(&self, request: &AnalysisRequest) -> CoreResult<Option<String>>;

    /// Remove every expired entry, returning how many were removed.
    async fn delete_expired(&self) -> CoreResult<u64>;

    /// Remove every entry produced by the named module type.
    async fn delete_for_module(&self, module_name: &str) -> CoreResult<u64>;

    /// Number of entries, optionally restricted to one module type.
    async fn size(&self, module_name: Option<&str>) -> CoreResult<u64>;

    /// Remove every cached result.
    async fn reset(&self) -> CoreResult<()>;
}

struct CacheRecord {
    module_name: String,
    expiration_date: DateTime<Utc>,
    json_data: String,
}

/// In-memory result cache.
pub struct MemoryResultCache {
    entries: DashMap<String, CacheRecord>,
}

impl MemoryResultCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for MemoryResultCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultCache for MemoryResultCache {
    async fn get(&self, cache_key: &str) -> CoreResult<Option<AnalysisRequest>> {
        let json_data = match self.entries.get(cache_key) {
            Some(record) => {
                if record.expiration_date <= Utc::now() {
                    drop(record);
                    self.entries.remove(cache_key);
                    return Ok(None);
                }
                record.json_data.clone()
            }
            None => return Ok(None),
        };

        Ok(Some(serde_json::from_str(&json_data)?))
    }

    async fn put(&self, request: &AnalysisRequest) -> CoreResult<Option<String>> {
        let module_type = match &request.module_type {
            Some(module_type) => module_type,
            None => return Ok(None),
        };

        let cache_ttl = match module_type.cache_ttl {
            Some(cache_ttl) => cache_ttl,
            None => return Ok(None),
        };

        let cache_key = match &request.cache_key {
            Some(cache_key) => cache_key.clone(),
            None => {
                return Err(CoreError::Invariant(format!(
                    "cachable request {} has no cache key",
                    request.id
                )))
            }
        };

        let record = CacheRecord {
            module_name: module_type.name.clone(),
            expiration_date: Utc::now() + Duration::seconds(cache_ttl as i64),
            json_data: serde_json::to_string(request)?,
        };

        self.entries.insert(cache_key.clone(), record);
        Ok(Some(cache_key))
    }

    async fn delete_expired(&self) -> CoreResult<u64> {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, record| record.expiration_date > now);
        Ok((before - self.entries.len()) as u64)
    }

    async fn delete_for_module(&self, module_name: &str) -> CoreResult<u64> {
        let before = self.entries.len();
        self.entries
            .retain(|_, record| record.module_name != module_name);
        Ok((before - self.entries.len()) as u64)
    }

    async fn size(&self, module_name: Option<&str>) -> CoreResult<u64> {
        match module_name {
            None => Ok(self.entries.len() as u64),
            Some(name) => Ok(self
                .entries
                .iter()
                .filter(|entry| entry.module_name == name)
                .count() as u64),
        }
    }

    async fn reset(&self) -> CoreResult<()> {
        self.entries.clear();
        Ok(())
    }
}

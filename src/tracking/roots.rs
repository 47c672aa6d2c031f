//! Root analysis store with optimistic concurrency, plus the sibling
//! details store for large opaque payloads.
//!
//! Roots are persisted as JSON with details payloads excluded; details are
//! keyed by analysis uuid and cascade-deleted with their root. Every
//! successful update mints a fresh opaque version token.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::RootAnalysis;

/// Contract for root analysis and details persistence.
#[async_trait]
pub trait RootStore: Send + Sync {
    /// Insert a new root. Returns false when the uuid is already tracked.
    /// Mints a version token when the root has none; the root's in-memory
    /// `version` is updated on success.
    async fn track_root(&self, root: &mut RootAnalysis) -> CoreResult<bool>;

    /// Fetch a root by uuid. The returned root carries the stored version
    /// token and no details payloads.
    async fn get_root(&self, uuid: Uuid) -> CoreResult<Option<RootAnalysis>>;

    /// Optimistic update: succeeds iff the stored version equals
    /// `root.version`, minting a fresh token and updating the caller's
    /// in-memory `version`. Returns false on mismatch.
    async fn update_root(&self, root: &mut RootAnalysis) -> CoreResult<bool>;

    /// True when the root is tracked.
    async fn root_exists(&self, uuid: Uuid) -> CoreResult<bool>;

    /// Delete a root and cascade to its details. Returns false when absent.
    async fn delete_root(&self, uuid: Uuid) -> CoreResult<bool>;

    /// Store a details payload for an analysis in the given root. Returns
    /// true on insert, false on replace. Fails with `UnknownRootAnalysis`
    /// when the root is not tracked.
    async fn track_details(
        &self,
        root_uuid: Uuid,
        uuid: Uuid,
        value: &serde_json::Value,
    ) -> CoreResult<bool>;

    /// Fetch a details payload by analysis uuid.
    async fn get_details(&self, uuid: Uuid) -> CoreResult<Option<serde_json::Value>>;

    /// Delete a details payload. Returns false when absent.
    async fn delete_details(&self, uuid: Uuid) -> CoreResult<bool>;

    /// Remove every root and details record.
    async fn reset(&self) -> CoreResult<()>;
}

struct RootRecord {
    version: String,
    json_data: String,
    #[allow(dead_code)]
    insert_date: DateTime<Utc>,
}

struct DetailsRecord {
    root_uuid: Uuid,
    json_data: String,
}

/// In-memory root and details store.
pub struct MemoryRootStore {
    roots: DashMap<Uuid, RootRecord>,
    details: DashMap<Uuid, DetailsRecord>,
}

impl MemoryRootStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            roots: DashMap::new(),
            details: DashMap::new(),
        }
    }

    fn mint_version() -> String {
        Uuid::new_v4().to_string()
    }
}

impl Default for MemoryRootStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RootStore for MemoryRootStore {
    async fn track_root(&self, root: &mut RootAnalysis) -> CoreResult<bool> {
        if self.roots.contains_key(&root.uuid) {
            return Ok(false);
        }

        let version = root
            .version
            .clone()
            .unwrap_or_else(Self::mint_version);
        root.version = Some(version.clone());

        let record = RootRecord {
            version,
            json_data: serde_json::to_string(root)?,
            insert_date: Utc::now(),
        };

        // entry-level insert keeps concurrent duplicate submissions from
        // both claiming the insert
        match self.roots.entry(root.uuid) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(true)
            }
        }
    }

    async fn get_root(&self, uuid: Uuid) -> CoreResult<Option<RootAnalysis>> {
        let (version, json_data) = match self.roots.get(&uuid) {
            Some(record) => (record.version.clone(), record.json_data.clone()),
            None => return Ok(None),
        };

        // the record column holds the authoritative version; the JSON copy
        // is whatever it was when the root was serialized
        let mut root: RootAnalysis = serde_json::from_str(&json_data)?;
        root.version = Some(version);
        Ok(Some(root))
    }

    async fn update_root(&self, root: &mut RootAnalysis) -> CoreResult<bool> {
        let expected = match &root.version {
            Some(version) => version.clone(),
            None => {
                return Err(CoreError::Invariant(format!(
                    "update_root called without a version for {}",
                    root.uuid
                )))
            }
        };

        let new_version = Self::mint_version();
        root.version = Some(new_version.clone());
        let json_data = serde_json::to_string(root)?;

        match self.roots.get_mut(&root.uuid) {
            Some(mut record) => {
                if record.version != expected {
                    root.version = Some(expected);
                    return Ok(false);
                }
                record.version = new_version;
                record.json_data = json_data;
                Ok(true)
            }
            None => {
                root.version = Some(expected);
                Ok(false)
            }
        }
    }

    async fn root_exists(&self, uuid: Uuid) -> CoreResult<bool> {
        Ok(self.roots.contains_key(&uuid))
    }

    async fn delete_root(&self, uuid: Uuid) -> CoreResult<bool> {
        let removed = self.roots.remove(&uuid).is_some();
        if removed {
            self.details.retain(|_, record| record.root_uuid != uuid);
        }
        Ok(removed)
    }

    async fn track_details(
        &self,
        root_uuid: Uuid,
        uuid: Uuid,
        value: &serde_json::Value,
    ) -> CoreResult<bool> {
        if !self.roots.contains_key(&root_uuid) {
            return Err(CoreError::UnknownRootAnalysis(root_uuid));
        }

        let record = DetailsRecord {
            root_uuid,
            json_data: serde_json::to_string(value)?,
        };

        Ok(self.details.insert(uuid, record).is_none())
    }

    async fn get_details(&self, uuid: Uuid) -> CoreResult<Option<serde_json::Value>> {
        match self.details.get(&uuid) {
            Some(record) => Ok(Some(serde_json::from_str(&record.json_data)?)),
            None => Ok(None),
        }
    }

    async fn delete_details(&self, uuid: Uuid) -> CoreResult<bool> {
        Ok(self.details.remove(&uuid).is_some())
    }

    async fn reset(&self) -> CoreResult<()> {
        self.roots.clear();
        self.details.clear();
        Ok(())
    }
}

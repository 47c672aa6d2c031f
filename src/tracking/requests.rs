//! In-flight analysis request tracking: status, expiration, advisory locks
//! and the request-linking graph used for deduplication.
//!
//! The lock and link decisions are the concurrency-critical operations.
//! Both are made while holding exclusive access to the source record, so a
//! link can never attach to a request that a processor has already locked.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::CoreResult;
use crate::models::AnalysisRequest;

/// Contract for analysis request tracking.
#[async_trait]
pub trait RequestTracker: Send + Sync {
    /// Insert or update a request record. Updating preserves the record's
    /// lock state and links.
    async fn track(&self, request: &AnalysisRequest) -> CoreResult<()>;

    /// Fetch a request by id.
    async fn get(&self, id: Uuid) -> CoreResult<Option<AnalysisRequest>>;

    /// Fetch the in-flight request holding the given cache key.
    async fn get_by_cache_key(&self, cache_key: &str) -> CoreResult<Option<AnalysisRequest>>;

    /// All requests belonging to the given root.
    async fn get_by_root(&self, root_uuid: Uuid) -> CoreResult<Vec<AnalysisRequest>>;

    /// All requests whose processing deadline has elapsed.
    async fn get_expired(&self) -> CoreResult<Vec<AnalysisRequest>>;

    /// Expired requests for one module type.
    async fn expired_for_module(&self, module_name: &str) -> CoreResult<Vec<AnalysisRequest>>;

    /// Delete a request and every link referencing it. Returns false when
    /// absent.
    async fn delete(&self, id: Uuid) -> CoreResult<bool>;

    /// Acquire the advisory lock: succeeds atomically iff the stored lock
    /// is clear, recording the acquisition timestamp.
    async fn lock(&self, id: Uuid) -> CoreResult<bool>;

    /// Release the advisory lock: succeeds iff the stored lock is held.
    async fn unlock(&self, id: Uuid) -> CoreResult<bool>;

    /// Link `dest` to `source` so the source's result hydrates the dest's
    /// root. Succeeds atomically iff the source exists and is unlocked.
    async fn link(&self, source: Uuid, dest: Uuid) -> CoreResult<bool>;

    /// Requests linked to the given source.
    async fn linked_requests(&self, source: Uuid) -> CoreResult<Vec<AnalysisRequest>>;

    /// Drop every request for the named module type, returning the count.
    async fn clear_for_module(&self, module_name: &str) -> CoreResult<u64>;

    /// Clear locks for the named module type held longer than `max_age`,
    /// returning how many were broken.
    async fn break_stale_locks(&self, module_name: &str, max_age: Duration) -> CoreResult<u64>;

    /// Remove every tracked request and link.
    async fn reset(&self) -> CoreResult<()>;
}

struct RequestRecord {
    json_data: String,
    module_name: Option<String>,
    cache_key: Option<String>,
    root_uuid: Uuid,
    expiration_date: Option<DateTime<Utc>>,
    lock: Option<DateTime<Utc>>,
    links: Vec<Uuid>,
}

/// In-memory request tracker.
pub struct MemoryRequestTracker {
    records: DashMap<Uuid, RequestRecord>,
    cache_key_index: DashMap<String, Uuid>,
}

impl MemoryRequestTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            cache_key_index: DashMap::new(),
        }
    }

    fn decode(&self, json_data: &str) -> CoreResult<AnalysisRequest> {
        Ok(serde_json::from_str(json_data)?)
    }

    fn drop_index_entry(&self, cache_key: &Option<String>, id: Uuid) {
        if let Some(key) = cache_key {
            self.cache_key_index
                .remove_if(key, |_, indexed| *indexed == id);
        }
    }
}

impl Default for MemoryRequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestTracker for MemoryRequestTracker {
    async fn track(&self, request: &AnalysisRequest) -> CoreResult<()> {
        let json_data = serde_json::to_string(request)?;

        match self.records.entry(request.id) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                record.json_data = json_data;
                record.expiration_date = request.expiration_date;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(RequestRecord {
                    json_data,
                    module_name: request.module_name().map(str::to_string),
                    cache_key: request.cache_key.clone(),
                    root_uuid: request.root.uuid,
                    expiration_date: request.expiration_date,
                    lock: None,
                    links: Vec::new(),
                });

                if let Some(key) = &request.cache_key {
                    // first tracker of a fingerprint becomes the in-flight
                    // request; linked shadows do not displace it
                    self.cache_key_index
                        .entry(key.clone())
                        .or_insert(request.id);
                }
            }
        }

        Ok(())
    }

    async fn get(&self, id: Uuid) -> CoreResult<Option<AnalysisRequest>> {
        match self.records.get(&id) {
            Some(record) => Ok(Some(self.decode(&record.json_data)?)),
            None => Ok(None),
        }
    }

    async fn get_by_cache_key(&self, cache_key: &str) -> CoreResult<Option<AnalysisRequest>> {
        let id = match self.cache_key_index.get(cache_key) {
            Some(entry) => *entry,
            None => return Ok(None),
        };
        self.get(id).await
    }

    async fn get_by_root(&self, root_uuid: Uuid) -> CoreResult<Vec<AnalysisRequest>> {
        let mut result = Vec::new();
        for record in self.records.iter() {
            if record.root_uuid == root_uuid {
                result.push(self.decode(&record.json_data)?);
            }
        }
        Ok(result)
    }

    async fn get_expired(&self) -> CoreResult<Vec<AnalysisRequest>> {
        let now = Utc::now();
        let mut result = Vec::new();
        for record in self.records.iter() {
            let request = self.decode(&record.json_data)?;
            if request.is_expired(now) {
                result.push(request);
            }
        }
        Ok(result)
    }

    async fn expired_for_module(&self, module_name: &str) -> CoreResult<Vec<AnalysisRequest>> {
        let now = Utc::now();
        let mut result = Vec::new();
        for record in self.records.iter() {
            if record.module_name.as_deref() != Some(module_name) {
                continue;
            }
            let request = self.decode(&record.json_data)?;
            if request.is_expired(now) {
                result.push(request);
            }
        }
        Ok(result)
    }

    async fn delete(&self, id: Uuid) -> CoreResult<bool> {
        let removed = match self.records.remove(&id) {
            Some((_, record)) => record,
            None => return Ok(false),
        };

        self.drop_index_entry(&removed.cache_key, id);

        // cascade: remove link rows pointing at the deleted request
        for mut record in self.records.iter_mut() {
            record.links.retain(|linked| *linked != id);
        }

        Ok(true)
    }

    async fn lock(&self, id: Uuid) -> CoreResult<bool> {
        match self.records.get_mut(&id) {
            Some(mut record) => {
                if record.lock.is_some() {
                    return Ok(false);
                }
                record.lock = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn unlock(&self, id: Uuid) -> CoreResult<bool> {
        match self.records.get_mut(&id) {
            Some(mut record) => Ok(record.lock.take().is_some()),
            None => Ok(false),
        }
    }

    async fn link(&self, source: Uuid, dest: Uuid) -> CoreResult<bool> {
        match self.records.get_mut(&source) {
            Some(mut record) => {
                if record.lock.is_some() {
                    return Ok(false);
                }
                if !record.links.contains(&dest) {
                    record.links.push(dest);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn linked_requests(&self, source: Uuid) -> CoreResult<Vec<AnalysisRequest>> {
        let links = match self.records.get(&source) {
            Some(record) => record.links.clone(),
            None => return Ok(Vec::new()),
        };

        let mut result = Vec::new();
        for dest in links {
            if let Some(request) = self.get(dest).await? {
                result.push(request);
            }
        }
        Ok(result)
    }

    async fn clear_for_module(&self, module_name: &str) -> CoreResult<u64> {
        let doomed: Vec<Uuid> = self
            .records
            .iter()
            .filter(|record| record.module_name.as_deref() == Some(module_name))
            .map(|record| *record.key())
            .collect();

        let mut count = 0;
        for id in doomed {
            if self.delete(id).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn break_stale_locks(&self, module_name: &str, max_age: Duration) -> CoreResult<u64> {
        let cutoff = Utc::now() - max_age;
        let mut count = 0;
        for mut record in self.records.iter_mut() {
            if record.module_name.as_deref() != Some(module_name) {
                continue;
            }
            if let Some(acquired) = record.lock {
                if acquired < cutoff {
                    record.lock = None;
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn reset(&self) -> CoreResult<()> {
        self.records.clear();
        self.cache_key_index.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisModuleType, Observable, RequestStatus, RootAnalysis};

    fn tracked_request(module_name: &str) -> AnalysisRequest {
        AnalysisRequest::observable(
            RootAnalysis::new(),
            Observable::new("test", "test"),
            AnalysisModuleType::new(module_name).with_cache_ttl(600),
        )
    }

    #[tokio::test]
    async fn test_track_and_get() {
        let tracker = MemoryRequestTracker::new();
        let request = tracked_request("t");
        tracker.track(&request).await.unwrap();

        let stored = tracker.get(request.id).await.unwrap().unwrap();
        assert_eq!(stored.id, request.id);
        assert!(tracker.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_by_cache_key_returns_first_tracked() {
        let tracker = MemoryRequestTracker::new();
        let first = tracked_request("t");
        let mut second = tracked_request("t");
        second.cache_key = first.cache_key.clone();

        tracker.track(&first).await.unwrap();
        tracker.track(&second).await.unwrap();

        let key = first.cache_key.as_deref().unwrap();
        let in_flight = tracker.get_by_cache_key(key).await.unwrap().unwrap();
        assert_eq!(in_flight.id, first.id);
    }

    #[tokio::test]
    async fn test_get_by_root() {
        let tracker = MemoryRequestTracker::new();
        let request = tracked_request("t");
        let root_uuid = request.root.uuid;
        tracker.track(&request).await.unwrap();
        tracker.track(&tracked_request("t")).await.unwrap();

        let for_root = tracker.get_by_root(root_uuid).await.unwrap();
        assert_eq!(for_root.len(), 1);
        assert_eq!(for_root[0].id, request.id);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let tracker = MemoryRequestTracker::new();
        let request = tracked_request("t");
        tracker.track(&request).await.unwrap();

        assert!(tracker.lock(request.id).await.unwrap());
        assert!(!tracker.lock(request.id).await.unwrap());
        assert!(tracker.unlock(request.id).await.unwrap());
        assert!(!tracker.unlock(request.id).await.unwrap());
        assert!(tracker.lock(request.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_track_update_preserves_lock() {
        let tracker = MemoryRequestTracker::new();
        let mut request = tracked_request("t");
        tracker.track(&request).await.unwrap();
        assert!(tracker.lock(request.id).await.unwrap());

        request.status = RequestStatus::Analyzing;
        tracker.track(&request).await.unwrap();

        // the lock survived the update
        assert!(!tracker.lock(request.id).await.unwrap());
        assert!(tracker.unlock(request.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_link_requires_unlocked_source() {
        let tracker = MemoryRequestTracker::new();
        let source = tracked_request("t");
        let mut dest = tracked_request("t");
        dest.cache_key = source.cache_key.clone();
        tracker.track(&source).await.unwrap();
        tracker.track(&dest).await.unwrap();

        assert!(tracker.link(source.id, dest.id).await.unwrap());
        let linked = tracker.linked_requests(source.id).await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, dest.id);

        // once locked, further linking fails
        assert!(tracker.lock(source.id).await.unwrap());
        let late = tracked_request("t");
        tracker.track(&late).await.unwrap();
        assert!(!tracker.link(source.id, late.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_link_to_missing_source_fails() {
        let tracker = MemoryRequestTracker::new();
        let dest = tracked_request("t");
        tracker.track(&dest).await.unwrap();
        assert!(!tracker.link(Uuid::new_v4(), dest.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_cascades_links_and_index() {
        let tracker = MemoryRequestTracker::new();
        let source = tracked_request("t");
        let mut dest = tracked_request("t");
        dest.cache_key = source.cache_key.clone();
        tracker.track(&source).await.unwrap();
        tracker.track(&dest).await.unwrap();
        tracker.link(source.id, dest.id).await.unwrap();

        // deleting the dest removes it from the source's link list
        assert!(tracker.delete(dest.id).await.unwrap());
        assert!(tracker.linked_requests(source.id).await.unwrap().is_empty());

        // deleting the source clears the cache key index
        let key = source.cache_key.clone().unwrap();
        assert!(tracker.delete(source.id).await.unwrap());
        assert!(tracker.get_by_cache_key(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expiration_scan() {
        let tracker = MemoryRequestTracker::new();
        let mut expired = tracked_request("t");
        expired.status = RequestStatus::Analyzing;
        expired.expiration_date = Some(Utc::now() - Duration::seconds(5));
        tracker.track(&expired).await.unwrap();

        let mut healthy = tracked_request("t");
        healthy.status = RequestStatus::Analyzing;
        healthy.expiration_date = Some(Utc::now() + Duration::seconds(600));
        tracker.track(&healthy).await.unwrap();

        let mut other_module = tracked_request("other");
        other_module.status = RequestStatus::Analyzing;
        other_module.expiration_date = Some(Utc::now() - Duration::seconds(5));
        tracker.track(&other_module).await.unwrap();

        assert_eq!(tracker.get_expired().await.unwrap().len(), 2);

        let for_module = tracker.expired_for_module("t").await.unwrap();
        assert_eq!(for_module.len(), 1);
        assert_eq!(for_module[0].id, expired.id);
    }

    #[tokio::test]
    async fn test_clear_for_module() {
        let tracker = MemoryRequestTracker::new();
        tracker.track(&tracked_request("t")).await.unwrap();
        tracker.track(&tracked_request("t")).await.unwrap();
        tracker.track(&tracked_request("other")).await.unwrap();

        assert_eq!(tracker.clear_for_module("t").await.unwrap(), 2);
        assert_eq!(tracker.clear_for_module("t").await.unwrap(), 0);
        assert_eq!(tracker.clear_for_module("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_break_stale_locks() {
        let tracker = MemoryRequestTracker::new();
        let request = tracked_request("t");
        tracker.track(&request).await.unwrap();
        assert!(tracker.lock(request.id).await.unwrap());

        // a generous max age leaves the lock alone
        assert_eq!(
            tracker
                .break_stale_locks("t", Duration::seconds(3600))
                .await
                .unwrap(),
            0
        );

        // a zero max age makes any held lock stale
        assert_eq!(
            tracker
                .break_stale_locks("t", Duration::seconds(0))
                .await
                .unwrap(),
            1
        );
        assert!(tracker.lock(request.id).await.unwrap());
    }
}

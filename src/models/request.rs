//! Analysis requests: the unit of work routed through the tracker, the
//! work queues and the processor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::generate_cache_key;
use crate::models::analysis::RootAnalysis;
use crate::models::module_type::AnalysisModuleType;
use crate::models::observable::Observable;

/// Lifecycle status of an analysis request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Created, not yet queued.
    New,
    /// Waiting on a work queue.
    Queued,
    /// Claimed by a worker; the expiration timer is running.
    Analyzing,
    /// Result posted, merge pending.
    Completed,
}

/// A request to analyze a root (root request) or one observable with one
/// module type (observable request).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    /// Request identifier. Stable across expiration re-queues so links
    /// remain valid.
    pub id: Uuid,

    /// Snapshot of the root this request belongs to.
    pub root: RootAnalysis,

    /// The observable to analyze. Absent for root requests.
    #[serde(default)]
    pub observable: Option<Observable>,

    /// The module type to run. Absent for root requests.
    #[serde(rename = "type", default)]
    pub module_type: Option<AnalysisModuleType>,

    /// Current lifecycle status.
    pub status: RequestStatus,

    /// Deduplication fingerprint. Present only for cachable module types.
    #[serde(default)]
    pub cache_key: Option<String>,

    /// Identifier of the worker that claimed this request.
    #[serde(default)]
    pub owner: Option<String>,

    /// Root version observed when the request was created.
    #[serde(default)]
    pub original_root_version: Option<String>,

    /// Deadline set when the request enters `Analyzing`.
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,

    /// The modified root posted back by the worker.
    #[serde(default)]
    pub modified_root: Option<RootAnalysis>,
}

impl AnalysisRequest {
    /// Create a root analysis request.
    pub fn root(root: RootAnalysis) -> Self {
        let original_root_version = root.version.clone();
        Self {
            id: Uuid::new_v4(),
            root,
            observable: None,
            module_type: None,
            status: RequestStatus::New,
            cache_key: None,
            owner: None,
            original_root_version,
            expiration_date: None,
            modified_root: None,
        }
    }

    /// Create an observable analysis request for the given module type.
    /// The cache key is derived here and is absent when the module type is
    /// not cachable.
    pub fn observable(
        root: RootAnalysis,
        observable: Observable,
        module_type: AnalysisModuleType,
    ) -> Self {
        let cache_key = generate_cache_key(&observable, &module_type);
        let original_root_version = root.version.clone();
        Self {
            id: Uuid::new_v4(),
            root,
            observable: Some(observable),
            module_type: Some(module_type),
            status: RequestStatus::New,
            cache_key,
            owner: None,
            original_root_version,
            expiration_date: None,
            modified_root: None,
        }
    }

    /// True for root requests (no observable target).
    pub fn is_root_request(&self) -> bool {
        self.observable.is_none()
    }

    /// Name of the target module type, when present.
    pub fn module_name(&self) -> Option<&str> {
        self.module_type.as_ref().map(|amt| amt.name.as_str())
    }

    /// True when the request carries a worker result.
    pub fn has_result(&self) -> bool {
        self.modified_root.is_some()
    }

    /// True when the `Analyzing` deadline has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Analyzing
            && self
                .expiration_date
                .map(|deadline| deadline < now)
                .unwrap_or(false)
    }
}

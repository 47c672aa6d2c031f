//! System-wide constants: event names, configuration keys and default
//! tunables shared across the core components.

/// A new root analysis was tracked.
pub const EVENT_ROOT_NEW: &str = "root_new";
/// An existing root analysis was updated.
pub const EVENT_ROOT_MODIFIED: &str = "root_modified";
/// A root analysis was deleted.
pub const EVENT_ROOT_DELETED: &str = "root_deleted";
/// A root analysis with `expires` set became unreferenced.
pub const EVENT_ROOT_EXPIRED: &str = "root_expired";

/// Analysis details were stored for the first time.
pub const EVENT_DETAILS_NEW: &str = "details_new";
/// Analysis details were replaced.
pub const EVENT_DETAILS_MODIFIED: &str = "details_modified";
/// Analysis details were deleted.
pub const EVENT_DETAILS_DELETED: &str = "details_deleted";

/// An analysis request was tracked.
pub const EVENT_AR_NEW: &str = "ar_new";
/// An analysis request was deleted.
pub const EVENT_AR_DELETED: &str = "ar_deleted";
/// An analysis request exceeded its processing deadline and was re-queued.
pub const EVENT_AR_EXPIRED: &str = "ar_expired";

/// An analysis module type was registered for the first time.
pub const EVENT_AMT_NEW: &str = "amt_new";
/// An analysis module type registration replaced a differing record.
pub const EVENT_AMT_MODIFIED: &str = "amt_modified";
/// An analysis module type was deleted.
pub const EVENT_AMT_DELETED: &str = "amt_deleted";

/// An analysis result was stored in the result cache.
pub const EVENT_CACHE_NEW: &str = "cache_new";
/// A cache lookup was satisfied from the result cache.
pub const EVENT_CACHE_HIT: &str = "cache_hit";

/// A work queue was created.
pub const EVENT_WORK_QUEUE_NEW: &str = "work_queue_new";
/// A work queue was deleted along with its contents.
pub const EVENT_WORK_QUEUE_DELETED: &str = "work_queue_deleted";
/// A request was placed on a work queue.
pub const EVENT_WORK_ADD: &str = "work_add";
/// A request was removed from a work queue.
pub const EVENT_WORK_REMOVE: &str = "work_remove";
/// A request was claimed by a module worker.
pub const EVENT_WORK_ASSIGNED: &str = "work_assigned";

/// An alert system was registered.
pub const EVENT_ALERT_SYSTEM_REGISTERED: &str = "alert_system_registered";
/// An alert system was unregistered.
pub const EVENT_ALERT_SYSTEM_UNREGISTERED: &str = "alert_system_unregistered";
/// A root analysis with detection points was submitted for alerting.
pub const EVENT_ALERT: &str = "alert";

/// Content was stored in the blob store.
pub const EVENT_STORAGE_NEW: &str = "storage_new";
/// Content was deleted from the blob store.
pub const EVENT_STORAGE_DELETED: &str = "storage_deleted";

/// A configuration setting was stored.
pub const EVENT_CONFIG_SET: &str = "config_set";

/// The processor accepted a root analysis request.
pub const EVENT_PROCESSING_REQUEST_ROOT: &str = "processing_request_root";
/// The processor accepted an observable analysis request.
pub const EVENT_PROCESSING_REQUEST_OBSERVABLE: &str = "processing_request_observable";
/// The processor accepted a completed analysis result.
pub const EVENT_PROCESSING_REQUEST_RESULT: &str = "processing_request_result";

/// Configuration key for the database connection URL used by relational
/// backends.
pub const CONFIG_DB_URL: &str = "/ace/core/database/url";
/// Environment variable overriding [`CONFIG_DB_URL`].
pub const ENV_DB_URL: &str = "ACE_DB_URL";

/// Configuration key for the blob storage root directory.
pub const CONFIG_STORAGE_ROOT: &str = "/ace/core/storage/path";
/// Environment variable overriding [`CONFIG_STORAGE_ROOT`].
pub const ENV_STORAGE_ROOT: &str = "ACE_STORAGE_ROOT";

/// Default analysis module timeout in seconds.
pub const DEFAULT_AMT_TIMEOUT: u64 = 30;
/// Default analysis module version.
pub const DEFAULT_AMT_VERSION: &str = "1.0.0";

/// Default number of additional attempts for optimistic version conflicts
/// and backend deadlocks before the error surfaces.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 2;

/// Multiplier applied to a module timeout to decide when a request lock is
/// stale enough to break.
pub const STALE_LOCK_MULTIPLIER: u32 = 2;

/// Default buffer size for streaming blob content.
pub const DEFAULT_CONTENT_BUFFER_SIZE: usize = 64 * 1024;

//! The core system: one struct holding every component implementation
//! behind its contract.
//!
//! There is no process-wide singleton; construct a [`CoreSystem`] and pass
//! it to whatever needs it. Tests build one per scenario. Every publicly
//! observable state change fires exactly one event, always after the change
//! has committed to the owning store.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::alerting::{AlertBroker, MemoryAlertBroker};
use crate::auth::{ApiKeyStore, MemoryApiKeyStore};
use crate::cache::{MemoryResultCache, ResultCache};
use crate::config::{ConfigStore, ConfigurationSetting, MemoryConfigStore};
use crate::constants::*;
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::models::content::{ContentMetadata, ContentSpec};
use crate::models::{AnalysisModuleType, Event, RootAnalysis};
use crate::queues::{MemoryWorkQueueStore, WorkQueueStore};
use crate::registry::{MemoryModuleRegistry, ModuleRegistry};
use crate::retry::RetryPolicy;
use crate::storage::local::LocalBlobStore;
use crate::storage::BlobStore;
use crate::tracking::{MemoryRequestTracker, MemoryRootStore, RequestTracker, RootStore};

/// Builder for [`CoreSystem`]. Defaults to the in-memory component set with
/// blob storage under `./storage` (or `ACE_STORAGE_ROOT`).
pub struct CoreSystemBuilder {
    registry: Option<Arc<dyn ModuleRegistry>>,
    roots: Option<Arc<dyn RootStore>>,
    requests: Option<Arc<dyn RequestTracker>>,
    cache: Option<Arc<dyn ResultCache>>,
    work_queues: Option<Arc<dyn WorkQueueStore>>,
    storage: Option<Arc<dyn BlobStore>>,
    config: Option<Arc<dyn ConfigStore>>,
    auth: Option<Arc<dyn ApiKeyStore>>,
    alerting: Option<Arc<dyn AlertBroker>>,
    retry: RetryPolicy,
    storage_root: Option<PathBuf>,
}

impl CoreSystemBuilder {
    /// Create a builder with defaults.
    pub fn new() -> Self {
        Self {
            registry: None,
            roots: None,
            requests: None,
            cache: None,
            work_queues: None,
            storage: None,
            config: None,
            auth: None,
            alerting: None,
            retry: RetryPolicy::default(),
            storage_root: None,
        }
    }

    /// Use the given blob storage root directory.
    pub fn storage_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(path.into());
        self
    }

    /// Replace the module registry implementation.
    pub fn registry(mut self, registry: Arc<dyn ModuleRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the root store implementation.
    pub fn roots(mut self, roots: Arc<dyn RootStore>) -> Self {
        self.roots = Some(roots);
        self
    }

    /// Replace the request tracker implementation.
    pub fn requests(mut self, requests: Arc<dyn RequestTracker>) -> Self {
        self.requests = Some(requests);
        self
    }

    /// Replace the result cache implementation.
    pub fn cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the work queue implementation.
    pub fn work_queues(mut self, work_queues: Arc<dyn WorkQueueStore>) -> Self {
        self.work_queues = Some(work_queues);
        self
    }

    /// Replace the blob store implementation.
    pub fn storage(mut self, storage: Arc<dyn BlobStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Replace the configuration store implementation.
    pub fn config(mut self, config: Arc<dyn ConfigStore>) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the api key store implementation.
    pub fn auth(mut self, auth: Arc<dyn ApiKeyStore>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Replace the alert broker implementation.
    pub fn alerting(mut self, alerting: Arc<dyn AlertBroker>) -> Self {
        self.alerting = Some(alerting);
        self
    }

    /// Replace the retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build the system.
    pub fn build(self) -> CoreSystem {
        let storage_root = self.storage_root.unwrap_or_else(|| {
            std::env::var(ENV_STORAGE_ROOT)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./storage"))
        });

        CoreSystem {
            storage_root: storage_root.clone(),
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(MemoryModuleRegistry::new())),
            roots: self
                .roots
                .unwrap_or_else(|| Arc::new(MemoryRootStore::new())),
            requests: self
                .requests
                .unwrap_or_else(|| Arc::new(MemoryRequestTracker::new())),
            cache: self
                .cache
                .unwrap_or_else(|| Arc::new(MemoryResultCache::new())),
            work_queues: self
                .work_queues
                .unwrap_or_else(|| Arc::new(MemoryWorkQueueStore::new())),
            storage: self
                .storage
                .unwrap_or_else(|| Arc::new(LocalBlobStore::new(storage_root))),
            config: self
                .config
                .unwrap_or_else(|| Arc::new(MemoryConfigStore::new())),
            auth: self
                .auth
                .unwrap_or_else(|| Arc::new(MemoryApiKeyStore::new())),
            alerting: self
                .alerting
                .unwrap_or_else(|| Arc::new(MemoryAlertBroker::new())),
            events: Arc::new(EventBus::new()),
            retry: self.retry,
            sweeper: parking_lot::Mutex::new(None),
            sweeper_running: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for CoreSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled core.
pub struct CoreSystem {
    storage_root: PathBuf,
    pub(crate) registry: Arc<dyn ModuleRegistry>,
    pub(crate) roots: Arc<dyn RootStore>,
    pub(crate) requests: Arc<dyn RequestTracker>,
    pub(crate) cache: Arc<dyn ResultCache>,
    pub(crate) work_queues: Arc<dyn WorkQueueStore>,
    pub(crate) storage: Arc<dyn BlobStore>,
    pub(crate) config: Arc<dyn ConfigStore>,
    pub(crate) auth: Arc<dyn ApiKeyStore>,
    pub(crate) alerting: Arc<dyn AlertBroker>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) retry: RetryPolicy,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
    sweeper_running: Arc<AtomicBool>,
}

impl CoreSystem {
    /// Build a system with the default in-memory component set.
    pub fn new() -> Self {
        CoreSystemBuilder::new().build()
    }

    /// Builder for customized construction.
    pub fn builder() -> CoreSystemBuilder {
        CoreSystemBuilder::new()
    }

    /// The event bus.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub(crate) async fn fire<T: Serialize>(&self, name: &str, args: &T) -> CoreResult<()> {
        self.events
            .fire(Event::new(name, serde_json::to_value(args)?))
            .await
    }

    //
    // module registry
    //

    /// Register an analysis module type.
    ///
    /// Registration is idempotent on identical payloads; a differing
    /// payload replaces the stored record and fires `amt_modified`. Every
    /// dependency must already be registered. A work queue is created for
    /// new module types.
    pub async fn register_analysis_module_type(
        &self,
        module_type: AnalysisModuleType,
    ) -> CoreResult<AnalysisModuleType> {
        if module_type.name.is_empty() {
            return Err(CoreError::InvalidModuleType(
                "module type name must be non-empty".to_string(),
            ));
        }

        if semver::Version::parse(&module_type.version).is_err() {
            return Err(CoreError::InvalidModuleType(format!(
                "module type {} version {} is not a valid version string",
                module_type.name, module_type.version
            )));
        }

        for dependency in &module_type.dependencies {
            if self.registry.get(dependency).await?.is_none() {
                return Err(CoreError::AmtDependency {
                    amt: module_type.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }

        let existing = self.registry.get(&module_type.name).await?;
        self.registry.track(&module_type).await?;

        if self.work_queues.add_queue(&module_type.name).await? {
            self.fire(EVENT_WORK_QUEUE_NEW, &module_type.name).await?;
        }

        match existing {
            None => self.fire(EVENT_AMT_NEW, &module_type).await?,
            Some(previous) if previous != module_type => {
                self.fire(EVENT_AMT_MODIFIED, &module_type).await?
            }
            Some(_) => {}
        }

        Ok(module_type)
    }

    /// Fetch a registered module type by name.
    pub async fn get_analysis_module_type(
        &self,
        name: &str,
    ) -> CoreResult<Option<AnalysisModuleType>> {
        self.registry.get(name).await
    }

    /// All registered module types.
    pub async fn get_all_analysis_module_types(&self) -> CoreResult<Vec<AnalysisModuleType>> {
        self.registry.list().await
    }

    /// Delete a module type, cascading to its tracked requests, cached
    /// results and work queue. `amt_deleted` fires last so subscribers
    /// observe a consistent state.
    pub async fn delete_analysis_module_type(&self, name: &str) -> CoreResult<bool> {
        let module_type = match self.registry.get(name).await? {
            Some(module_type) => module_type,
            None => return Ok(false),
        };

        self.requests.clear_for_module(name).await?;
        self.cache.delete_for_module(name).await?;
        if self.work_queues.delete_queue(name).await? {
            self.fire(EVENT_WORK_QUEUE_DELETED, &name).await?;
        }
        self.registry.delete(name).await?;
        self.fire(EVENT_AMT_DELETED, &module_type).await?;
        Ok(true)
    }

    //
    // root tracking
    //

    /// Track a new root. Returns false when the uuid is already tracked.
    pub async fn track_root_analysis(&self, root: &mut RootAnalysis) -> CoreResult<bool> {
        if !self.roots.track_root(root).await? {
            return Ok(false);
        }
        self.fire(EVENT_ROOT_NEW, root).await?;
        Ok(true)
    }

    /// Fetch a root by uuid. Details payloads are not included.
    pub async fn get_root_analysis(&self, uuid: Uuid) -> CoreResult<Option<RootAnalysis>> {
        self.roots.get_root(uuid).await
    }

    /// Optimistic root update. Returns false on version mismatch.
    pub async fn update_root_analysis(&self, root: &mut RootAnalysis) -> CoreResult<bool> {
        if !self.roots.update_root(root).await? {
            return Ok(false);
        }
        self.fire(EVENT_ROOT_MODIFIED, root).await?;
        Ok(true)
    }

    /// True when the root is tracked.
    pub async fn root_analysis_exists(&self, uuid: Uuid) -> CoreResult<bool> {
        self.roots.root_exists(uuid).await
    }

    /// Delete a root, cascading to details and storage root pins.
    pub async fn delete_root_analysis(&self, uuid: Uuid) -> CoreResult<bool> {
        if !self.roots.delete_root(uuid).await? {
            return Ok(false);
        }
        self.storage.clear_root_tracking(uuid).await?;
        self.fire(EVENT_ROOT_DELETED, &uuid).await?;
        Ok(true)
    }

    /// Store an analysis details payload.
    pub async fn track_analysis_details(
        &self,
        root_uuid: Uuid,
        uuid: Uuid,
        value: &serde_json::Value,
    ) -> CoreResult<()> {
        let inserted = self.roots.track_details(root_uuid, uuid, value).await?;
        let args = serde_json::json!({"root_uuid": root_uuid, "uuid": uuid});
        if inserted {
            self.fire(EVENT_DETAILS_NEW, &args).await?;
        } else {
            self.fire(EVENT_DETAILS_MODIFIED, &args).await?;
        }
        Ok(())
    }

    /// Fetch an analysis details payload.
    pub async fn get_analysis_details(
        &self,
        uuid: Uuid,
    ) -> CoreResult<Option<serde_json::Value>> {
        self.roots.get_details(uuid).await
    }

    /// Delete an analysis details payload.
    pub async fn delete_analysis_details(&self, uuid: Uuid) -> CoreResult<bool> {
        if !self.roots.delete_details(uuid).await? {
            return Ok(false);
        }
        self.fire(EVENT_DETAILS_DELETED, &uuid).await?;
        Ok(true)
    }

    //
    // configuration
    //

    /// Read a configuration value, preferring the environment override,
    /// then the stored setting, then the default.
    pub async fn get_config_value(
        &self,
        key: &str,
        default: Option<serde_json::Value>,
        env: Option<&str>,
    ) -> CoreResult<Option<serde_json::Value>> {
        if let Some(env) = env {
            if let Ok(value) = std::env::var(env) {
                return Ok(Some(serde_json::Value::String(value)));
            }
        }

        if let Some(setting) = self.config.get(key).await? {
            return Ok(Some(setting.value));
        }

        Ok(default)
    }

    /// Fetch a stored configuration setting.
    pub async fn get_config(&self, key: &str) -> CoreResult<Option<ConfigurationSetting>> {
        self.config.get(key).await
    }

    /// Store a configuration setting.
    pub async fn set_config(
        &self,
        key: &str,
        value: serde_json::Value,
        documentation: Option<String>,
    ) -> CoreResult<()> {
        self.config.set(key, value, documentation).await?;
        self.fire(EVENT_CONFIG_SET, &key).await?;
        Ok(())
    }

    /// Delete a configuration setting.
    pub async fn delete_config(&self, key: &str) -> CoreResult<bool> {
        self.config.delete(key).await
    }

    //
    // authentication
    //

    /// Create an api key, returning the clear value exactly once.
    pub async fn create_api_key(
        &self,
        name: &str,
        description: Option<String>,
        is_admin: bool,
    ) -> CoreResult<String> {
        self.auth.create(name, description, is_admin).await
    }

    /// Delete an api key by name.
    pub async fn delete_api_key(&self, name: &str) -> CoreResult<bool> {
        self.auth.delete(name).await
    }

    /// Verify an api key, optionally requiring admin.
    pub async fn verify_api_key(&self, api_key: &str, require_admin: bool) -> CoreResult<bool> {
        self.auth.verify(api_key, require_admin).await
    }

    //
    // alerting
    //

    /// Register an alert system.
    pub async fn register_alert_system(&self, name: &str) -> CoreResult<bool> {
        if !self.alerting.register(name).await? {
            return Ok(false);
        }
        self.fire(EVENT_ALERT_SYSTEM_REGISTERED, &name).await?;
        Ok(true)
    }

    /// Unregister an alert system.
    pub async fn unregister_alert_system(&self, name: &str) -> CoreResult<bool> {
        if !self.alerting.unregister(name).await? {
            return Ok(false);
        }
        self.fire(EVENT_ALERT_SYSTEM_UNREGISTERED, &name).await?;
        Ok(true)
    }

    /// Submit a root for alerting, fanning its uuid out to every
    /// registered alert system.
    pub async fn submit_alert(&self, root_uuid: Uuid) -> CoreResult<bool> {
        let delivered = self.alerting.submit(root_uuid).await?;
        self.fire(EVENT_ALERT, &root_uuid).await?;
        Ok(delivered)
    }

    /// Fetch pending alerts for an alert system, optionally long-polling.
    pub async fn get_alerts(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> CoreResult<Vec<Uuid>> {
        self.alerting.get_alerts(name, timeout).await
    }

    //
    // request tracking queries
    //

    /// Fetch a tracked analysis request by id.
    pub async fn get_analysis_request(
        &self,
        id: Uuid,
    ) -> CoreResult<Option<crate::models::AnalysisRequest>> {
        self.requests.get(id).await
    }

    /// Every tracked request referencing the given root.
    pub async fn get_analysis_requests_by_root(
        &self,
        root_uuid: Uuid,
    ) -> CoreResult<Vec<crate::models::AnalysisRequest>> {
        self.requests.get_by_root(root_uuid).await
    }

    /// Number of requests waiting on a module type's work queue.
    pub async fn queue_size(&self, module_name: &str) -> CoreResult<u64> {
        self.work_queues.queue_size(module_name).await
    }

    /// Number of cached results, optionally for one module type.
    pub async fn cache_size(&self, module_name: Option<&str>) -> CoreResult<u64> {
        self.cache.size(module_name).await
    }

    //
    // blob storage
    //

    /// Store content in the blob store.
    pub async fn store_content(
        &self,
        data: &[u8],
        spec: ContentSpec,
    ) -> CoreResult<ContentMetadata> {
        let meta = self.storage.store_content(data, spec).await?;
        self.fire(EVENT_STORAGE_NEW, &meta.sha256).await?;
        Ok(meta)
    }

    /// Fetch content metadata.
    pub async fn get_content_meta(&self, sha256: &str) -> CoreResult<Option<ContentMetadata>> {
        self.storage.get_content_meta(sha256).await
    }

    /// Fetch content bytes.
    pub async fn get_content_bytes(&self, sha256: &str) -> CoreResult<Option<Vec<u8>>> {
        self.storage.get_content_bytes(sha256).await
    }

    /// Open a lazy chunk reader over stored content.
    pub async fn iter_content(
        &self,
        sha256: &str,
        buffer_size: usize,
    ) -> CoreResult<Option<crate::storage::ContentChunks>> {
        self.storage.iter_content(sha256, buffer_size).await
    }

    /// Materialize stored content at the given path.
    pub async fn load_file(
        &self,
        sha256: &str,
        dest: &std::path::Path,
    ) -> CoreResult<Option<ContentMetadata>> {
        self.storage.load_file(sha256, dest).await
    }

    /// Store a file from the local filesystem.
    pub async fn save_file(
        &self,
        path: &std::path::Path,
        spec: ContentSpec,
    ) -> CoreResult<String> {
        let sha256 = self.storage.save_file(path, spec).await?;
        self.fire(EVENT_STORAGE_NEW, &sha256).await?;
        Ok(sha256)
    }

    /// Delete content.
    pub async fn delete_content(&self, sha256: &str) -> CoreResult<bool> {
        if !self.storage.delete_content(sha256).await? {
            return Ok(false);
        }
        self.fire(EVENT_STORAGE_DELETED, &sha256).await?;
        Ok(true)
    }

    /// Pin content to a root.
    pub async fn track_content_root(&self, sha256: &str, root_uuid: Uuid) -> CoreResult<()> {
        self.storage.track_content_root(sha256, root_uuid).await
    }

    /// Every expired, unreferenced blob.
    pub async fn iter_expired_content(&self) -> CoreResult<Vec<ContentMetadata>> {
        self.storage.expired_content().await
    }

    /// Garbage-collect expired unreferenced blobs, returning the count
    /// deleted.
    pub async fn delete_expired_content(&self) -> CoreResult<u64> {
        let mut count = 0;
        for meta in self.storage.expired_content().await? {
            if self.delete_content(&meta.sha256).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    //
    // lifecycle
    //

    /// Prepare a freshly constructed system for use: record the resolved
    /// storage root and, when present, the database url in the
    /// configuration store so operators can read the effective settings.
    /// Calling it again is a no-op for keys that already exist.
    pub async fn initialize(&self) -> CoreResult<()> {
        if self.config.get(CONFIG_STORAGE_ROOT).await?.is_none() {
            let resolved = self
                .get_config_value(
                    CONFIG_STORAGE_ROOT,
                    Some(serde_json::Value::String(
                        self.storage_root.display().to_string(),
                    )),
                    Some(ENV_STORAGE_ROOT),
                )
                .await?;
            if let Some(value) = resolved {
                self.set_config(
                    CONFIG_STORAGE_ROOT,
                    value,
                    Some("blob storage root directory".to_string()),
                )
                .await?;
            }
        }

        if self.config.get(CONFIG_DB_URL).await?.is_none() {
            let resolved = self
                .get_config_value(CONFIG_DB_URL, None, Some(ENV_DB_URL))
                .await?;
            if let Some(value) = resolved {
                self.set_config(
                    CONFIG_DB_URL,
                    value,
                    Some("database connection url for relational backends".to_string()),
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Return the system to an empty state: the sweeper is stopped and
    /// every component store is cleared, including registered event
    /// handlers and stored blobs. Tests build one system per scenario and
    /// call this between phases that must not share state.
    pub async fn reset(&self) -> CoreResult<()> {
        self.stop_sweeper();
        self.registry.reset().await?;
        self.roots.reset().await?;
        self.requests.reset().await?;
        self.cache.reset().await?;
        self.work_queues.reset().await?;
        self.storage.reset().await?;
        self.config.reset().await?;
        self.auth.reset().await?;
        self.alerting.reset().await?;
        self.events.clear();
        Ok(())
    }

    /// Start the background sweeper: expired request re-queueing, cache
    /// expiry and blob garbage collection.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        if self.sweeper_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let system = Arc::clone(self);
        let running = Arc::clone(&self.sweeper_running);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if let Err(error) = system.sweep().await {
                    log::error!("sweeper pass failed: {}", error);
                }
            }
        });

        *self.sweeper.lock() = Some(handle);
    }

    /// Stop the background sweeper.
    pub fn stop_sweeper(&self) {
        self.sweeper_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    async fn sweep(&self) -> CoreResult<()> {
        self.process_expired_analysis_requests().await?;
        self.cache.delete_expired().await?;
        self.delete_expired_content().await?;
        Ok(())
    }
}

impl Default for CoreSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CoreSystem {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initialize_records_effective_settings() {
        let system = CoreSystem::builder().storage_root("/var/lib/ace").build();
        assert!(system.get_config(CONFIG_STORAGE_ROOT).await.unwrap().is_none());

        system.initialize().await.unwrap();
        let setting = system
            .get_config(CONFIG_STORAGE_ROOT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(setting.value, serde_json::json!("/var/lib/ace"));

        // a second initialize leaves existing settings alone
        system
            .set_config(CONFIG_STORAGE_ROOT, serde_json::json!("/other"), None)
            .await
            .unwrap();
        system.initialize().await.unwrap();
        let setting = system
            .get_config(CONFIG_STORAGE_ROOT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(setting.value, serde_json::json!("/other"));
    }

    #[tokio::test]
    async fn test_reset_clears_every_store() {
        let system = CoreSystem::new();

        system
            .register_analysis_module_type(AnalysisModuleType::new("t"))
            .await
            .unwrap();
        let mut root = RootAnalysis::new();
        let root_uuid = root.uuid;
        system.track_root_analysis(&mut root).await.unwrap();
        let api_key = system.create_api_key("test", None, false).await.unwrap();
        system.register_alert_system("siem").await.unwrap();
        system
            .set_config("/test/key", serde_json::json!(1), None)
            .await
            .unwrap();

        system.reset().await.unwrap();

        assert!(system
            .get_analysis_module_type("t")
            .await
            .unwrap()
            .is_none());
        assert!(system.get_root_analysis(root_uuid).await.unwrap().is_none());
        assert!(matches!(
            system.queue_size("t").await,
            Err(CoreError::UnknownAnalysisModuleType(_))
        ));
        assert!(!system.verify_api_key(&api_key, false).await.unwrap());
        assert!(matches!(
            system.get_alerts("siem", None).await,
            Err(CoreError::UnknownAlertSystem(_))
        ));
        assert!(system.get_config("/test/key").await.unwrap().is_none());
    }
}

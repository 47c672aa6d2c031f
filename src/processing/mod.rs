//! The request processor: root expansion, per-observable dispatch, cache
//! reuse, request linking, result merging and recursion to quiescence.
//!
//! Dispatch repeatedly scans a root's observables against every registered
//! module type until a full pass produces no change. Each eligible pair
//! either reuses a cached result, links to an in-flight request sharing its
//! cache key, or queues fresh work. A root is quiescent when no tracked
//! request references it; quiescent roots with detection points are
//! submitted for alerting, and expiring roots are deleted.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::generate_cache_key;
use crate::constants::*;
use crate::error::{CoreError, CoreResult};
use crate::models::{
    AnalysisModuleType, AnalysisRequest, Observable, RequestStatus, RootAnalysis,
};
use crate::system::CoreSystem;

impl CoreSystem {
    /// Submit a root analysis for processing.
    pub async fn submit_root_analysis(&self, root: RootAnalysis) -> CoreResult<()> {
        self.process_analysis_request(AnalysisRequest::root(root))
            .await
    }

    /// Process an analysis request, dispatching on its kind: a root
    /// request expands a submitted root into observable work; an
    /// observable request carrying a worker result merges that result into
    /// every waiting root; an observable request without a result is
    /// placed on its module's work queue.
    pub async fn process_analysis_request(&self, request: AnalysisRequest) -> CoreResult<()> {
        if request.is_root_request() {
            self.process_root_request(request).await
        } else if request.has_result() {
            self.process_analysis_result(request).await
        } else {
            self.queue_observable_request(request).await
        }
    }

    async fn queue_observable_request(&self, mut request: AnalysisRequest) -> CoreResult<()> {
        self.fire(EVENT_PROCESSING_REQUEST_OBSERVABLE, &request.id)
            .await?;

        let module_name = request
            .module_name()
            .ok_or_else(|| {
                CoreError::Invariant(format!(
                    "observable request {} has no module type",
                    request.id
                ))
            })?
            .to_string();

        if self.registry.get(&module_name).await?.is_none() {
            return Err(CoreError::UnknownAnalysisModuleType(module_name));
        }

        request.status = RequestStatus::Queued;
        request.owner = None;
        request.expiration_date = None;
        self.requests.track(&request).await?;
        self.work_queues.put(&module_name, &request).await?;
        self.fire(EVENT_WORK_ADD, &request.id).await?;
        Ok(())
    }

    async fn process_root_request(&self, request: AnalysisRequest) -> CoreResult<()> {
        self.fire(EVENT_PROCESSING_REQUEST_ROOT, &request.id).await?;

        let mut root = request.root;
        let root_uuid = root.uuid;

        if self.roots.root_exists(root_uuid).await? {
            self.process_duplicate_root(root).await?;
        } else {
            let mut details = root.extract_details();
            self.dispatch_root(&mut root).await?;
            // cache hits during dispatch may have merged analysis that
            // carries details of its own
            details.extend(root.extract_details());

            if self.roots.track_root(&mut root).await? {
                self.fire(EVENT_ROOT_NEW, &root).await?;
                for (uuid, value) in &details {
                    self.track_analysis_details(root_uuid, *uuid, value).await?;
                }
            } else {
                // lost the insert race with a concurrent duplicate
                // submission; merge instead, then store the payloads
                self.process_duplicate_root(root).await?;
                for (uuid, value) in &details {
                    self.track_analysis_details(root_uuid, *uuid, value).await?;
                }
            }
        }

        self.finalize_root(root_uuid).await
    }

    async fn process_duplicate_root(&self, submitted: RootAnalysis) -> CoreResult<()> {
        let mut working = match self.roots.get_root(submitted.uuid).await? {
            Some(mut stored) => {
                stored.merge_from(&submitted);
                stored
            }
            None => return Err(CoreError::UnknownRootAnalysis(submitted.uuid)),
        };

        self.dispatch_root(&mut working).await?;
        self.persist_root(&mut working).await
    }

    async fn process_analysis_result(&self, request: AnalysisRequest) -> CoreResult<()> {
        self.fire(EVENT_PROCESSING_REQUEST_RESULT, &request.id)
            .await?;

        let module_type = request.module_type.clone().ok_or_else(|| {
            CoreError::Invariant(format!("analysis result {} has no module type", request.id))
        })?;
        let observable = request.observable.clone().ok_or_else(|| {
            CoreError::Invariant(format!("analysis result {} has no observable", request.id))
        })?;
        let result_root = request.modified_root.clone().ok_or_else(|| {
            CoreError::Invariant(format!("analysis result {} carries no result", request.id))
        })?;

        // claim the request; a lost claim means another processor owns it,
        // or the expiration sweeper will revive it
        if !self.requests.lock(request.id).await? {
            log::warn!("unable to lock analysis request {}", request.id);
            return Ok(());
        }

        self.merge_result_into_root(request.root.uuid, &observable, &module_type, &result_root)
            .await?;

        let mut completed = request.clone();
        completed.status = RequestStatus::Completed;
        if let Some(cache_key) = self.cache.put(&completed).await? {
            self.fire(EVENT_CACHE_NEW, &cache_key).await?;
        }

        // the deduplication payoff: one module execution hydrates every
        // linked root
        let linked = self.requests.linked_requests(request.id).await?;
        for shadow in &linked {
            if let Some(shadow_obs) = &shadow.observable {
                self.merge_result_into_root(
                    shadow.root.uuid,
                    shadow_obs,
                    &module_type,
                    &result_root,
                )
                .await?;
            }
        }

        if self.requests.delete(request.id).await? {
            self.fire(EVENT_AR_DELETED, &request.id).await?;
        }
        for shadow in &linked {
            if self.requests.delete(shadow.id).await? {
                self.fire(EVENT_AR_DELETED, &shadow.id).await?;
            }
        }

        self.finalize_root(request.root.uuid).await?;
        for shadow in &linked {
            if shadow.root.uuid != request.root.uuid {
                self.finalize_root(shadow.root.uuid).await?;
            }
        }

        Ok(())
    }

    /// Merge a module result into one root, re-dispatch the root to pick
    /// up newly produced observables, and persist.
    async fn merge_result_into_root(
        &self,
        root_uuid: Uuid,
        observable: &Observable,
        module_type: &AnalysisModuleType,
        result_root: &RootAnalysis,
    ) -> CoreResult<()> {
        let mut working = match self.roots.get_root(root_uuid).await? {
            Some(root) => root,
            None => {
                log::warn!("root {} disappeared before result merge", root_uuid);
                return Ok(());
            }
        };

        if !working.merge_analysis_result(
            &observable.observable_type,
            &observable.value,
            &module_type.name,
            result_root,
        ) {
            log::warn!(
                "result from {} carries no analysis for {} {}",
                module_type.name,
                observable.observable_type,
                observable.value
            );
        }

        self.dispatch_root(&mut working).await?;
        self.persist_root(&mut working).await
    }

    /// Expand a root: for every observable and every registered module
    /// type, reuse a cached result, link against an in-flight request, or
    /// queue fresh work. Passes repeat until one produces no change, so
    /// analysis merged from the cache can unlock dependent modules in the
    /// same expansion. Returns the number of requests created.
    pub(crate) async fn dispatch_root(&self, root: &mut RootAnalysis) -> CoreResult<usize> {
        if root.analysis_cancelled {
            return Ok(0);
        }

        let module_types = self.registry.list().await?;
        let analysis_mode = root.analysis_mode.clone();
        let mut work_created = 0;

        loop {
            let mut changed = false;
            // each observable is considered once per pass; link cycles
            // cannot recurse because expansion walks the store, not the
            // graph edges
            let observable_ids: Vec<Uuid> = root.observable_store.keys().copied().collect();

            for observable_id in observable_ids {
                for module_type in &module_types {
                    let observable = match root.observable_store.get(&observable_id) {
                        Some(observable) => observable.clone(),
                        None => continue,
                    };

                    if !module_type.accepts(&observable, analysis_mode.as_deref()) {
                        continue;
                    }

                    if let Some(cache_key) = generate_cache_key(&observable, module_type) {
                        if let Some(hit) = self.cache.get(&cache_key).await? {
                            self.fire(EVENT_CACHE_HIT, &cache_key).await?;
                            if let Some(result_root) = &hit.modified_root {
                                root.merge_analysis_result(
                                    &observable.observable_type,
                                    &observable.value,
                                    &module_type.name,
                                    result_root,
                                );
                            }
                            // the hit is recorded whether or not analysis
                            // landed, so the pair never re-dispatches
                            if let Some(target) = root.observable_store.get_mut(&observable_id) {
                                target
                                    .request_tracking
                                    .insert(module_type.name.clone(), hit.id);
                            }
                            changed = true;
                            continue;
                        }
                    }

                    work_created += self
                        .dispatch_observable(root, observable_id, observable, module_type)
                        .await?;
                    changed = true;
                }
            }

            if !changed {
                return Ok(work_created);
            }
        }
    }

    /// Track a fresh request for one `(observable, module type)` pair and
    /// either link it to an in-flight request sharing its cache key or
    /// place it on the module's work queue.
    async fn dispatch_observable(
        &self,
        root: &mut RootAnalysis,
        observable_id: Uuid,
        observable: Observable,
        module_type: &AnalysisModuleType,
    ) -> CoreResult<usize> {
        let request =
            AnalysisRequest::observable(root.clone(), observable, module_type.clone());
        self.requests.track(&request).await?;
        self.fire(EVENT_AR_NEW, &request.id).await?;

        if let Some(target) = root.observable_store.get_mut(&observable_id) {
            target
                .request_tracking
                .insert(module_type.name.clone(), request.id);
        }

        let mut linked = false;
        if let Some(cache_key) = &request.cache_key {
            if let Some(existing) = self.requests.get_by_cache_key(cache_key).await? {
                if existing.id != request.id {
                    // the single atomic decision: attach only while the
                    // in-flight request is still unlocked
                    linked = self.requests.link(existing.id, request.id).await?;
                }
            }
        }

        if !linked {
            let mut queued = request;
            queued.status = RequestStatus::Queued;
            self.requests.track(&queued).await?;
            self.work_queues.put(&module_type.name, &queued).await?;
            self.fire(EVENT_WORK_ADD, &queued.id).await?;
        }

        Ok(1)
    }

    /// Persist a root under the retry policy. A version conflict re-reads
    /// the stored root, re-applies this root's changes and runs the update
    /// again; once the policy's attempts are exhausted
    /// `RootVersionConflict` surfaces.
    pub(crate) async fn persist_root(&self, root: &mut RootAnalysis) -> CoreResult<()> {
        let state = tokio::sync::Mutex::new(root);

        // retry version conflicts on top of whatever conflicts the
        // configured policy already covers (backend deadlocks by default)
        let base = self.retry.clone();
        let policy = self.retry.clone().with_predicate(Arc::new(move |error| {
            matches!(error, CoreError::RootVersionConflict(_)) || base.is_conflict(error)
        }));

        policy
            .run(|| async {
                let mut guard = state.lock().await;
                let root = &mut **guard;

                let details = root.extract_details();
                for (uuid, value) in &details {
                    self.track_analysis_details(root.uuid, *uuid, value).await?;
                }

                if self.roots.update_root(root).await? {
                    self.fire(EVENT_ROOT_MODIFIED, root).await?;
                    return Ok(());
                }

                // stale version: re-apply this root's changes onto the
                // stored copy and report the conflict for retry
                let snapshot = root.clone();
                match self.roots.get_root(snapshot.uuid).await? {
                    Some(mut stored) => {
                        stored.merge_from(&snapshot);
                        **guard = stored;
                        Err(CoreError::RootVersionConflict(snapshot.uuid))
                    }
                    // deleted while we held it; nothing left to persist
                    None => Ok(()),
                }
            })
            .await
    }

    /// Quiescence check: when no tracked request references the root,
    /// submit it for alerting if it carries detection points, and delete it
    /// if it expires.
    async fn finalize_root(&self, root_uuid: Uuid) -> CoreResult<()> {
        let root = match self.roots.get_root(root_uuid).await? {
            Some(root) => root,
            None => return Ok(()),
        };

        if !self.requests.get_by_root(root_uuid).await?.is_empty() {
            return Ok(());
        }

        if root.has_detection_points() {
            self.submit_alert(root_uuid).await?;
        }

        if root.expires {
            self.fire(EVENT_ROOT_EXPIRED, &root_uuid).await?;
            self.delete_root_analysis(root_uuid).await?;
        }

        Ok(())
    }

    /// Worker poll: hand out the next request for a module type, gated on
    /// the worker's version claim. The popped request is claim-locked,
    /// stamped `analyzing` with its processing deadline and owner, then
    /// released. Requests that cannot be claimed are skipped.
    pub async fn get_next_analysis_request(
        &self,
        owner: &str,
        module_name: &str,
        timeout: Duration,
        version: &str,
        extended_version: &[String],
    ) -> CoreResult<Option<AnalysisRequest>> {
        let module_type = self
            .registry
            .get(module_name)
            .await?
            .ok_or_else(|| CoreError::UnknownAnalysisModuleType(module_name.to_string()))?;

        if !module_type.version_matches(version, extended_version) {
            return Err(CoreError::AmtVersion {
                amt: module_name.to_string(),
                registered: module_type.version.clone(),
                requested: version.to_string(),
            });
        }

        let deadline = crate::queues::deadline_after(timeout);

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let mut request = match self.work_queues.get_next(module_name, remaining).await? {
                Some(request) => request,
                None => return Ok(None),
            };

            if !self.requests.lock(request.id).await? {
                log::warn!("skipping analysis request {} held elsewhere", request.id);
                continue;
            }

            request.status = RequestStatus::Analyzing;
            request.owner = Some(owner.to_string());
            request.expiration_date =
                Some(Utc::now() + chrono::Duration::seconds(module_type.timeout as i64));
            self.requests.track(&request).await?;
            self.requests.unlock(request.id).await?;

            self.fire(EVENT_WORK_REMOVE, &request.id).await?;
            self.fire(EVENT_WORK_ASSIGNED, &request.id).await?;
            return Ok(Some(request));
        }
    }

    /// Revive expired requests for every registered module type.
    pub async fn process_expired_analysis_requests(&self) -> CoreResult<()> {
        for module_type in self.registry.list().await? {
            self.process_expired_for_module(&module_type).await?;
        }
        Ok(())
    }

    /// Revive expired requests for one module type: break stale locks,
    /// then re-queue each expired request (or delete it when its module
    /// type has disappeared). Expired requests keep their id so existing
    /// links remain valid.
    pub async fn process_expired_for_module(
        &self,
        module_type: &AnalysisModuleType,
    ) -> CoreResult<()> {
        let max_age = chrono::Duration::seconds(
            (module_type.timeout * STALE_LOCK_MULTIPLIER as u64) as i64,
        );
        self.requests
            .break_stale_locks(&module_type.name, max_age)
            .await?;

        for mut request in self.requests.expired_for_module(&module_type.name).await? {
            // an expired request still locked is being completed right
            // now; leave it for the next sweep
            if !self.requests.lock(request.id).await? {
                continue;
            }

            self.fire(EVENT_AR_EXPIRED, &request.id).await?;

            if self.registry.get(&module_type.name).await?.is_none() {
                self.requests.delete(request.id).await?;
                self.fire(EVENT_AR_DELETED, &request.id).await?;
                continue;
            }

            request.status = RequestStatus::Queued;
            request.owner = None;
            request.expiration_date = None;
            self.requests.track(&request).await?;
            self.requests.unlock(request.id).await?;

            match self.work_queues.put(&module_type.name, &request).await {
                Ok(()) => self.fire(EVENT_WORK_ADD, &request.id).await?,
                Err(CoreError::UnknownAnalysisModuleType(_)) => {
                    self.requests.delete(request.id).await?;
                    self.fire(EVENT_AR_DELETED, &request.id).await?;
                }
                Err(error) => return Err(error),
            }
        }

        Ok(())
    }
}

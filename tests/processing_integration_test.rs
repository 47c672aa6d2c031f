//! End-to-end scenarios for the request processor: dispatch, caching,
//! linking, expiration, version gating, alerting and module lifecycle.

use std::sync::Arc;
use std::time::Duration;

use ace::constants::*;
use ace::events::testing::EventCollector;
use ace::models::{
    Analysis, AnalysisModuleType, AnalysisRequest, DetectionPoint, Observable, RequestStatus,
    RootAnalysis,
};
use ace::{CoreError, CoreSystem};

const WORKER: &str = "worker-0";

fn collect_all(system: &CoreSystem) -> Arc<EventCollector> {
    let collector = EventCollector::new();
    for event in [
        EVENT_ROOT_NEW,
        EVENT_ROOT_MODIFIED,
        EVENT_ROOT_DELETED,
        EVENT_ROOT_EXPIRED,
        EVENT_DETAILS_NEW,
        EVENT_DETAILS_MODIFIED,
        EVENT_AR_NEW,
        EVENT_AR_DELETED,
        EVENT_AR_EXPIRED,
        EVENT_AMT_NEW,
        EVENT_AMT_MODIFIED,
        EVENT_AMT_DELETED,
        EVENT_CACHE_NEW,
        EVENT_CACHE_HIT,
        EVENT_WORK_QUEUE_NEW,
        EVENT_WORK_QUEUE_DELETED,
        EVENT_WORK_ADD,
        EVENT_WORK_REMOVE,
        EVENT_WORK_ASSIGNED,
        EVENT_ALERT,
        EVENT_ALERT_SYSTEM_REGISTERED,
        EVENT_PROCESSING_REQUEST_ROOT,
        EVENT_PROCESSING_REQUEST_RESULT,
    ] {
        system.events().register_handler(event, collector.clone());
    }
    collector
}

/// Simulate a module worker completing a polled request with the given
/// details payload, optionally producing extra observables.
fn complete_request(
    mut request: AnalysisRequest,
    details: serde_json::Value,
    produced: &[(&str, &str)],
) -> AnalysisRequest {
    let observable = request.observable.clone().expect("observable request");
    let module_type = request.module_type.clone().expect("module type");

    let mut result = request.root.clone();
    let target_id = match result
        .find_observable_by_value(&observable.observable_type, &observable.value)
    {
        Some(existing) => existing.uuid,
        None => result.add_observable(observable.clone()),
    };

    let mut analysis = Analysis::new(module_type.name.clone(), target_id);
    analysis.details = Some(details);
    for (observable_type, value) in produced {
        let child_id = result.observable(*observable_type, *value);
        analysis.observable_ids.insert(child_id);
    }
    if let Some(target) = result.observable_store.get_mut(&target_id) {
        target.analysis.insert(module_type.name.clone(), analysis);
    }

    request.modified_root = Some(result);
    request.status = RequestStatus::Completed;
    request
}

async fn poll(system: &CoreSystem, amt: &str, version: &str) -> Option<AnalysisRequest> {
    system
        .get_next_analysis_request(WORKER, amt, Duration::ZERO, version, &[])
        .await
        .unwrap()
}

// ----------------------------------------------------------------------------
// single observable: cache miss, module returns, second root hits cache
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_single_observable_cache_round_trip() {
    let system = CoreSystem::new();
    let events = collect_all(&system);

    system
        .register_analysis_module_type(
            AnalysisModuleType::new("t")
                .with_version("1.0.0")
                .with_cache_ttl(60),
        )
        .await
        .unwrap();

    let mut root = RootAnalysis::new();
    root.observable("test", "test");
    let root_uuid = root.uuid;
    system.submit_root_analysis(root).await.unwrap();

    // the worker receives the request, stamped analyzing with a deadline
    let request = poll(&system, "t", "1.0.0").await.expect("queued work");
    assert_eq!(request.status, RequestStatus::Analyzing);
    assert!(request.expiration_date.is_some());
    assert_eq!(request.owner.as_deref(), Some(WORKER));
    let observable = request.observable.clone().unwrap();
    assert_eq!(observable.observable_type, "test");
    assert_eq!(observable.value, "test");

    // post the result
    let completed = complete_request(request, serde_json::json!({"test": "test"}), &[]);
    system.process_analysis_request(completed).await.unwrap();

    // the root carries the analysis, details stored separately
    let stored = system.get_root_analysis(root_uuid).await.unwrap().unwrap();
    let obs = stored.find_observable_by_value("test", "test").unwrap();
    let analysis = obs.analysis.get("t").expect("merged analysis");
    assert!(analysis.details.is_none());
    let details = system
        .get_analysis_details(analysis.uuid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(details, serde_json::json!({"test": "test"}));

    // the result landed in the cache
    assert_eq!(system.cache_size(Some("t")).await.unwrap(), 1);
    assert_eq!(events.count(EVENT_CACHE_NEW), 1);

    // a second root with the same observable is satisfied from the cache
    // and never enqueues work
    let mut second = RootAnalysis::new();
    second.observable("test", "test");
    let second_uuid = second.uuid;
    system.submit_root_analysis(second).await.unwrap();

    assert_eq!(events.count(EVENT_CACHE_HIT), 1);
    assert_eq!(system.queue_size("t").await.unwrap(), 0);
    assert_eq!(events.count(EVENT_WORK_ADD), 1);

    let stored = system
        .get_root_analysis(second_uuid)
        .await
        .unwrap()
        .unwrap();
    let obs = stored.find_observable_by_value("test", "test").unwrap();
    assert!(obs.analysis.contains_key("t"));
    // the cache hit is recorded against the observable
    assert!(obs.request_tracking.contains_key("t"));
}

// ----------------------------------------------------------------------------
// request expiration re-queues the work
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_expired_request_is_requeued() {
    let system = CoreSystem::new();
    let events = collect_all(&system);

    let module_type = system
        .register_analysis_module_type(
            AnalysisModuleType::new("t")
                .with_timeout(0)
                .with_cache_ttl(600),
        )
        .await
        .unwrap();

    let mut root = RootAnalysis::new();
    root.observable("test", "test");
    system.submit_root_analysis(root).await.unwrap();

    // claim the request; with a zero timeout it expires immediately
    let request = poll(&system, "t", "1.0.0").await.expect("queued work");
    assert_eq!(system.queue_size("t").await.unwrap(), 0);

    system
        .process_expired_for_module(&module_type)
        .await
        .unwrap();

    assert_eq!(events.count(EVENT_AR_EXPIRED), 1);
    assert_eq!(system.queue_size("t").await.unwrap(), 1);

    // the revived request kept its id so existing links stay valid
    let revived = poll(&system, "t", "1.0.0").await.expect("requeued work");
    assert_eq!(revived.id, request.id);
}

// ----------------------------------------------------------------------------
// linking: one execution hydrates every waiting root
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_linked_requests_share_one_execution() {
    let system = CoreSystem::new();
    let events = collect_all(&system);

    system
        .register_analysis_module_type(
            AnalysisModuleType::new("t")
                .with_version("1.0.0")
                .with_cache_ttl(60),
        )
        .await
        .unwrap();

    let mut first = RootAnalysis::new();
    first.observable("test", "test");
    let first_uuid = first.uuid;
    let mut second = RootAnalysis::new();
    second.observable("test", "test");
    let second_uuid = second.uuid;

    system.submit_root_analysis(first).await.unwrap();
    system.submit_root_analysis(second).await.unwrap();

    // exactly one work item despite two submissions
    assert_eq!(system.queue_size("t").await.unwrap(), 1);

    let request = poll(&system, "t", "1.0.0").await.expect("queued work");
    let completed = complete_request(request, serde_json::json!({"shared": true}), &[]);
    system.process_analysis_request(completed).await.unwrap();

    // both roots observe the same produced analysis
    let first_root = system.get_root_analysis(first_uuid).await.unwrap().unwrap();
    let second_root = system
        .get_root_analysis(second_uuid)
        .await
        .unwrap()
        .unwrap();
    let first_analysis = first_root
        .find_observable_by_value("test", "test")
        .unwrap()
        .analysis
        .get("t")
        .expect("first root analysis");
    let second_analysis = second_root
        .find_observable_by_value("test", "test")
        .unwrap()
        .analysis
        .get("t")
        .expect("second root analysis");
    assert_eq!(first_analysis.uuid, second_analysis.uuid);

    // no tracked requests survive
    assert!(system
        .get_analysis_requests_by_root(first_uuid)
        .await
        .unwrap()
        .is_empty());
    assert!(system
        .get_analysis_requests_by_root(second_uuid)
        .await
        .unwrap()
        .is_empty());

    assert_eq!(events.count(EVENT_PROCESSING_REQUEST_ROOT), 2);
    assert_eq!(events.count(EVENT_ROOT_MODIFIED), 2);
    assert_eq!(events.count(EVENT_WORK_ADD), 1);
    assert_eq!(events.count(EVENT_WORK_REMOVE), 1);
    assert_eq!(events.count(EVENT_CACHE_NEW), 1);
}

// ----------------------------------------------------------------------------
// optimistic concurrency on the root store
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_optimistic_conflict_requires_reread() {
    let system = CoreSystem::new();

    let mut root = RootAnalysis::new();
    let root_uuid = root.uuid;
    assert!(system.track_root_analysis(&mut root).await.unwrap());

    let mut first = system.get_root_analysis(root_uuid).await.unwrap().unwrap();
    let mut second = system.get_root_analysis(root_uuid).await.unwrap().unwrap();

    first.observable("test", "one");
    assert!(system.update_root_analysis(&mut first).await.unwrap());

    second.observable("test", "two");
    assert!(!system.update_root_analysis(&mut second).await.unwrap());

    // re-read, re-apply the delta, succeed
    let mut fresh = system.get_root_analysis(root_uuid).await.unwrap().unwrap();
    fresh.observable("test", "two");
    assert!(system.update_root_analysis(&mut fresh).await.unwrap());

    let stored = system.get_root_analysis(root_uuid).await.unwrap().unwrap();
    assert_eq!(stored.observable_store.len(), 2);
}

// ----------------------------------------------------------------------------
// version-gated worker poll
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_version_gated_poll() {
    let system = CoreSystem::new();

    system
        .register_analysis_module_type(AnalysisModuleType::new("t").with_version("1.0.0"))
        .await
        .unwrap();

    let mut root = RootAnalysis::new();
    root.observable("test", "test");
    system.submit_root_analysis(root).await.unwrap();

    let result = system
        .get_next_analysis_request(WORKER, "t", Duration::ZERO, "1.0.1", &[])
        .await;
    match result {
        Err(CoreError::AmtVersion {
            registered,
            requested,
            ..
        }) => {
            assert_eq!(registered, "1.0.0");
            assert_eq!(requested, "1.0.1");
        }
        other => panic!("expected version error, got {:?}", other.map(|_| ())),
    }

    // the request stayed in the queue
    assert_eq!(system.queue_size("t").await.unwrap(), 1);

    // a stale extended version is also rejected
    let result = system
        .get_next_analysis_request(
            WORKER,
            "t",
            Duration::ZERO,
            "1.0.0",
            &["sigs:unknown".to_string()],
        )
        .await;
    assert!(matches!(result, Err(CoreError::AmtVersion { .. })));
    assert_eq!(system.queue_size("t").await.unwrap(), 1);

    // unknown module types are a distinct failure
    let result = system
        .get_next_analysis_request(WORKER, "missing", Duration::ZERO, "1.0.0", &[])
        .await;
    assert!(matches!(
        result,
        Err(CoreError::UnknownAnalysisModuleType(_))
    ));
}

// ----------------------------------------------------------------------------
// recursion: dependencies and produced observables
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_dependency_chain_dispatches_after_result() {
    let system = CoreSystem::new();

    system
        .register_analysis_module_type(AnalysisModuleType::new("first"))
        .await
        .unwrap();
    system
        .register_analysis_module_type(
            AnalysisModuleType::new("second").with_dependencies(["first"]),
        )
        .await
        .unwrap();

    let mut root = RootAnalysis::new();
    root.observable("test", "test");
    let root_uuid = root.uuid;
    system.submit_root_analysis(root).await.unwrap();

    // only the dependency-free module is dispatched initially
    assert_eq!(system.queue_size("first").await.unwrap(), 1);
    assert_eq!(system.queue_size("second").await.unwrap(), 0);

    let request = poll(&system, "first", "1.0.0").await.expect("first work");
    let completed = complete_request(request, serde_json::json!({"step": 1}), &[]);
    system.process_analysis_request(completed).await.unwrap();

    // the merge unlocked the dependent module
    assert_eq!(system.queue_size("second").await.unwrap(), 1);

    let request = poll(&system, "second", "1.0.0").await.expect("second work");
    let completed = complete_request(request, serde_json::json!({"step": 2}), &[]);
    system.process_analysis_request(completed).await.unwrap();

    let stored = system.get_root_analysis(root_uuid).await.unwrap().unwrap();
    let obs = stored.find_observable_by_value("test", "test").unwrap();
    assert!(obs.analysis.contains_key("first"));
    assert!(obs.analysis.contains_key("second"));
    assert!(system
        .get_analysis_requests_by_root(root_uuid)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_produced_observables_are_dispatched() {
    let system = CoreSystem::new();

    system
        .register_analysis_module_type(AnalysisModuleType::new("expander"))
        .await
        .unwrap();

    let mut root = RootAnalysis::new();
    root.observable("url", "http://one.example.com/");
    let root_uuid = root.uuid;
    system.submit_root_analysis(root).await.unwrap();

    let request = poll(&system, "expander", "1.0.0").await.expect("work");
    let completed = complete_request(
        request,
        serde_json::json!({"crawled": true}),
        &[("fqdn", "one.example.com")],
    );
    system.process_analysis_request(completed).await.unwrap();

    // the produced observable was imported and generated new work
    let stored = system.get_root_analysis(root_uuid).await.unwrap().unwrap();
    assert!(stored
        .find_observable_by_value("fqdn", "one.example.com")
        .is_some());
    assert_eq!(system.queue_size("expander").await.unwrap(), 1);

    let request = poll(&system, "expander", "1.0.0").await.expect("child work");
    let observable = request.observable.clone().unwrap();
    assert_eq!(observable.observable_type, "fqdn");

    let completed = complete_request(request, serde_json::json!({"leaf": true}), &[]);
    system.process_analysis_request(completed).await.unwrap();

    // quiescent: both observables analyzed, nothing tracked
    let stored = system.get_root_analysis(root_uuid).await.unwrap().unwrap();
    assert_eq!(stored.observable_store.len(), 2);
    assert!(system
        .get_analysis_requests_by_root(root_uuid)
        .await
        .unwrap()
        .is_empty());
}

// ----------------------------------------------------------------------------
// alerting and root expiration
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_detection_points_trigger_alert() {
    let system = CoreSystem::new();
    let events = collect_all(&system);

    system.register_alert_system("siem").await.unwrap();
    system
        .register_analysis_module_type(AnalysisModuleType::new("detector"))
        .await
        .unwrap();

    let mut root = RootAnalysis::new();
    root.observable("test", "test");
    let root_uuid = root.uuid;
    system.submit_root_analysis(root).await.unwrap();

    let request = poll(&system, "detector", "1.0.0").await.expect("work");
    let mut completed = complete_request(request, serde_json::json!({"hit": true}), &[]);
    if let Some(result) = completed.modified_root.as_mut() {
        let obs_id = result
            .find_observable_by_value("test", "test")
            .map(|o| o.uuid)
            .unwrap();
        if let Some(obs) = result.observable_store.get_mut(&obs_id) {
            if let Some(analysis) = obs.analysis.get_mut("detector") {
                analysis.add_detection_point(DetectionPoint::new("malicious content"));
            }
        }
    }
    system.process_analysis_request(completed).await.unwrap();

    assert_eq!(events.count(EVENT_ALERT), 1);
    let alerts = system.get_alerts("siem", None).await.unwrap();
    assert_eq!(alerts, vec![root_uuid]);
}

#[tokio::test]
async fn test_clean_root_is_not_alerted() {
    let system = CoreSystem::new();
    let events = collect_all(&system);
    system.register_alert_system("siem").await.unwrap();

    // no module types registered: the root is quiescent on submission
    let mut root = RootAnalysis::new();
    root.observable("test", "test");
    system.submit_root_analysis(root).await.unwrap();

    assert_eq!(events.count(EVENT_ALERT), 0);
    assert!(system.get_alerts("siem", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_expiring_root_is_deleted_at_quiescence() {
    let system = CoreSystem::new();
    let events = collect_all(&system);

    let mut root = RootAnalysis::new().with_expires(true);
    root.observable("test", "test");
    let root_uuid = root.uuid;
    system.submit_root_analysis(root).await.unwrap();

    // no module types: quiescent immediately, so the root expires
    assert_eq!(events.count(EVENT_ROOT_EXPIRED), 1);
    assert_eq!(events.count(EVENT_ROOT_DELETED), 1);
    assert!(system.get_root_analysis(root_uuid).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expiring_root_survives_while_work_pending() {
    let system = CoreSystem::new();

    system
        .register_analysis_module_type(AnalysisModuleType::new("t"))
        .await
        .unwrap();

    let mut root = RootAnalysis::new().with_expires(true);
    root.observable("test", "test");
    let root_uuid = root.uuid;
    system.submit_root_analysis(root).await.unwrap();

    // work is outstanding, so the root must remain
    assert!(system.get_root_analysis(root_uuid).await.unwrap().is_some());

    let request = poll(&system, "t", "1.0.0").await.expect("work");
    let completed = complete_request(request, serde_json::json!({}), &[]);
    system.process_analysis_request(completed).await.unwrap();

    // quiescent now; the root expired away
    assert!(system.get_root_analysis(root_uuid).await.unwrap().is_none());
}

// ----------------------------------------------------------------------------
// module type lifecycle
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_registration_idempotence_events() {
    let system = CoreSystem::new();
    let events = collect_all(&system);

    let module_type = AnalysisModuleType::new("t").with_version("1.0.0");
    system
        .register_analysis_module_type(module_type.clone())
        .await
        .unwrap();
    system
        .register_analysis_module_type(module_type.clone())
        .await
        .unwrap();

    assert_eq!(events.count(EVENT_AMT_NEW), 1);
    assert_eq!(events.count(EVENT_AMT_MODIFIED), 0);

    // a differing payload replaces the record
    system
        .register_analysis_module_type(module_type.with_version("1.0.1"))
        .await
        .unwrap();
    assert_eq!(events.count(EVENT_AMT_MODIFIED), 1);

    let stored = system
        .get_analysis_module_type("t")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.version, "1.0.1");
}

#[tokio::test]
async fn test_registration_requires_known_dependencies() {
    let system = CoreSystem::new();
    let result = system
        .register_analysis_module_type(
            AnalysisModuleType::new("second").with_dependencies(["first"]),
        )
        .await;
    assert!(matches!(result, Err(CoreError::AmtDependency { .. })));
}

#[tokio::test]
async fn test_module_deletion_cascades() {
    let system = CoreSystem::new();
    let events = collect_all(&system);

    system
        .register_analysis_module_type(AnalysisModuleType::new("t").with_cache_ttl(60))
        .await
        .unwrap();

    let mut root = RootAnalysis::new();
    root.observable("test", "test");
    let root_uuid = root.uuid;
    system.submit_root_analysis(root).await.unwrap();
    assert_eq!(system.queue_size("t").await.unwrap(), 1);

    assert!(system.delete_analysis_module_type("t").await.unwrap());

    // tracked requests, the cache and the work queue are gone, and the
    // deletion event fired after the cascade
    assert!(system
        .get_analysis_requests_by_root(root_uuid)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(system.cache_size(Some("t")).await.unwrap(), 0);
    assert!(matches!(
        system.queue_size("t").await,
        Err(CoreError::UnknownAnalysisModuleType(_))
    ));
    assert_eq!(events.count(EVENT_AMT_DELETED), 1);
    assert_eq!(events.count(EVENT_WORK_QUEUE_DELETED), 1);

    assert!(!system.delete_analysis_module_type("t").await.unwrap());
}

// ----------------------------------------------------------------------------
// duplicate submission and gating
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_root_submission_merges() {
    let system = CoreSystem::new();

    let mut root = RootAnalysis::new();
    root.observable("test", "one");
    let root_uuid = root.uuid;
    system.submit_root_analysis(root.clone()).await.unwrap();

    // resubmit the same root with an extra observable
    root.observable("test", "two");
    system.submit_root_analysis(root).await.unwrap();

    let stored = system.get_root_analysis(root_uuid).await.unwrap().unwrap();
    assert_eq!(stored.observable_store.len(), 2);
}

#[tokio::test]
async fn test_excluded_analysis_is_never_dispatched() {
    let system = CoreSystem::new();

    system
        .register_analysis_module_type(AnalysisModuleType::new("t"))
        .await
        .unwrap();

    let mut root = RootAnalysis::new();
    let mut observable = Observable::new("test", "test");
    observable.excluded_analysis.insert("t".to_string());
    root.add_observable(observable);
    system.submit_root_analysis(root).await.unwrap();

    assert_eq!(system.queue_size("t").await.unwrap(), 0);
}

#[tokio::test]
async fn test_analysis_mode_gates_dispatch() {
    let system = CoreSystem::new();

    system
        .register_analysis_module_type(AnalysisModuleType::new("t").with_modes(["detect"]))
        .await
        .unwrap();

    let mut other_mode = RootAnalysis::new().with_analysis_mode("correlate");
    other_mode.observable("test", "test");
    system.submit_root_analysis(other_mode).await.unwrap();
    assert_eq!(system.queue_size("t").await.unwrap(), 0);

    let mut matching = RootAnalysis::new().with_analysis_mode("detect");
    matching.observable("test", "test");
    system.submit_root_analysis(matching).await.unwrap();
    assert_eq!(system.queue_size("t").await.unwrap(), 1);
}

#[tokio::test]
async fn test_event_completeness_over_full_cycle() {
    let system = CoreSystem::new();
    let events = collect_all(&system);

    system
        .register_analysis_module_type(AnalysisModuleType::new("t").with_cache_ttl(60))
        .await
        .unwrap();

    let mut root = RootAnalysis::new();
    root.observable("test", "test");
    system.submit_root_analysis(root).await.unwrap();

    let request = poll(&system, "t", "1.0.0").await.expect("work");
    let completed = complete_request(request, serde_json::json!({"test": "test"}), &[]);
    system.process_analysis_request(completed).await.unwrap();

    for event in [
        EVENT_AMT_NEW,
        EVENT_WORK_QUEUE_NEW,
        EVENT_PROCESSING_REQUEST_ROOT,
        EVENT_ROOT_NEW,
        EVENT_AR_NEW,
        EVENT_WORK_ADD,
        EVENT_WORK_REMOVE,
        EVENT_WORK_ASSIGNED,
        EVENT_PROCESSING_REQUEST_RESULT,
        EVENT_ROOT_MODIFIED,
        EVENT_DETAILS_NEW,
        EVENT_CACHE_NEW,
        EVENT_AR_DELETED,
    ] {
        assert!(events.count(event) >= 1, "missing event {}", event);
    }
}

//! Analysis output and the root analysis container.
//!
//! A root analysis owns a store of observables, each carrying per-module
//! analysis. Merging module results and duplicate submissions into a root
//! happens here; observables are matched across roots by their `(type,
//! value)` identity, never by uuid.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::models::module_type::AnalysisModuleType;
use crate::models::observable::{DetectionPoint, Observable};

/// The output of one analysis module for one observable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// Identifier, also the key for separately stored details.
    pub uuid: Uuid,

    /// Snapshot of the module type that produced this analysis.
    #[serde(rename = "type", default)]
    pub module_type: Option<AnalysisModuleType>,

    /// The observable this analysis was produced for.
    #[serde(default)]
    pub observable_id: Option<Uuid>,

    /// Observables produced by this analysis.
    #[serde(default)]
    pub observable_ids: BTreeSet<Uuid>,

    /// Short human-readable summary.
    #[serde(default)]
    pub summary: Option<String>,

    /// Opaque, schemaless details payload. Stored separately from the root;
    /// the core never parses it.
    #[serde(default)]
    pub details: Option<serde_json::Value>,

    /// Free-form tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Detection points attached to this analysis.
    #[serde(default)]
    pub detections: Vec<DetectionPoint>,
}

impl Analysis {
    /// Create an analysis attributed to the named module type.
    pub fn new(module_name: impl Into<String>, observable_id: Uuid) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            module_type: Some(AnalysisModuleType::new(module_name)),
            observable_id: Some(observable_id),
            observable_ids: BTreeSet::new(),
            summary: None,
            details: None,
            tags: BTreeSet::new(),
            detections: Vec::new(),
        }
    }

    /// Set the summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Set the details payload.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Add a detection point.
    pub fn add_detection_point(&mut self, detection: DetectionPoint) {
        if !self.detections.contains(&detection) {
            self.detections.push(detection);
        }
    }
}

/// The top-level container grouping the observables produced from one
/// ingestion event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootAnalysis {
    /// Root identifier.
    pub uuid: Uuid,

    /// Tool that generated this root.
    #[serde(default)]
    pub tool: Option<String>,

    /// Instance of the tool that generated this root.
    #[serde(default)]
    pub tool_instance: Option<String>,

    /// Alert type assigned when the root is alerted.
    #[serde(default)]
    pub alert_type: Option<String>,

    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,

    /// When the originating event occurred.
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,

    /// Optional name.
    #[serde(default)]
    pub name: Option<String>,

    /// Opaque module scratch space.
    #[serde(default)]
    pub state: HashMap<String, serde_json::Value>,

    /// Analysis mode gating which module types run.
    #[serde(default)]
    pub analysis_mode: Option<String>,

    /// Alert queue name.
    #[serde(default)]
    pub queue: Option<String>,

    /// Free-form analyst instructions.
    #[serde(default)]
    pub instructions: Option<String>,

    /// Opaque concurrency token minted by the root store.
    #[serde(default)]
    pub version: Option<String>,

    /// When set, the root is deleted once no tracked requests reference it.
    #[serde(default)]
    pub expires: bool,

    /// Set when analysis was cancelled.
    #[serde(default)]
    pub analysis_cancelled: bool,

    /// Why analysis was cancelled.
    #[serde(default)]
    pub analysis_cancelled_reason: Option<String>,

    /// Short human-readable summary.
    #[serde(default)]
    pub summary: Option<String>,

    /// Opaque details payload for the root itself, keyed by the root uuid
    /// in the details store.
    #[serde(default)]
    pub details: Option<serde_json::Value>,

    /// Free-form tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Detection points attached directly to the root.
    #[serde(default)]
    pub detections: Vec<DetectionPoint>,

    /// Every observable reachable from this root, keyed by uuid.
    #[serde(default)]
    pub observable_store: HashMap<Uuid, Observable>,
}

impl Default for RootAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

impl RootAnalysis {
    /// Create an empty root with a fresh uuid.
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            tool: None,
            tool_instance: None,
            alert_type: None,
            description: None,
            event_time: Some(Utc::now()),
            name: None,
            state: HashMap::new(),
            analysis_mode: None,
            queue: None,
            instructions: None,
            version: None,
            expires: false,
            analysis_cancelled: false,
            analysis_cancelled_reason: None,
            summary: None,
            details: None,
            tags: BTreeSet::new(),
            detections: Vec::new(),
            observable_store: HashMap::new(),
        }
    }

    /// Set the analysis mode.
    pub fn with_analysis_mode(mut self, mode: impl Into<String>) -> Self {
        self.analysis_mode = Some(mode.into());
        self
    }

    /// Set the expiration flag.
    pub fn with_expires(mut self, expires: bool) -> Self {
        self.expires = expires;
        self
    }

    /// Set the generating tool.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Add an observable, deduplicating on `(type, value)`. Returns the
    /// uuid of the stored observable.
    pub fn add_observable(&mut self, observable: Observable) -> Uuid {
        if let Some(existing) =
            self.find_observable_by_value(&observable.observable_type, &observable.value)
        {
            return existing.uuid;
        }

        let uuid = observable.uuid;
        self.observable_store.insert(uuid, observable);
        uuid
    }

    /// Create and add an observable from `(type, value)`.
    pub fn observable(
        &mut self,
        observable_type: impl Into<String>,
        value: impl Into<String>,
    ) -> Uuid {
        self.add_observable(Observable::new(observable_type, value))
    }

    /// Look up an observable by uuid.
    pub fn find_observable(&self, uuid: &Uuid) -> Option<&Observable> {
        self.observable_store.get(uuid)
    }

    /// Look up an observable by its `(type, value)` identity.
    pub fn find_observable_by_value(
        &self,
        observable_type: &str,
        value: &str,
    ) -> Option<&Observable> {
        self.observable_store
            .values()
            .find(|obs| obs.matches_value(observable_type, value))
    }

    /// All detection points on the root, its observables and their
    /// analyses.
    pub fn all_detection_points(&self) -> Vec<&DetectionPoint> {
        let mut result: Vec<&DetectionPoint> = self.detections.iter().collect();
        for observable in self.observable_store.values() {
            result.extend(observable.detection_points());
        }
        result
    }

    /// True when any detection point exists anywhere in the root.
    pub fn has_detection_points(&self) -> bool {
        !self.all_detection_points().is_empty()
    }

    /// Remove all details payloads from the root and its analyses,
    /// returning `(analysis uuid, payload)` pairs for the details store.
    /// The root's own payload is keyed by the root uuid.
    pub fn extract_details(&mut self) -> Vec<(Uuid, serde_json::Value)> {
        let mut extracted = Vec::new();

        if let Some(details) = self.details.take() {
            extracted.push((self.uuid, details));
        }

        for observable in self.observable_store.values_mut() {
            for analysis in observable.analysis.values_mut() {
                if let Some(details) = analysis.details.take() {
                    extracted.push((analysis.uuid, details));
                }
            }
        }

        extracted
    }

    /// Map every observable uuid in `source` to the uuid it resolves to in
    /// this root: the uuid of an identity match when one exists, otherwise
    /// the source uuid itself.
    fn build_id_map(&self, source: &RootAnalysis) -> HashMap<Uuid, Uuid> {
        source
            .observable_store
            .values()
            .map(|obs| {
                let target = self
                    .find_observable_by_value(&obs.observable_type, &obs.value)
                    .map(|existing| existing.uuid)
                    .unwrap_or(obs.uuid);
                (obs.uuid, target)
            })
            .collect()
    }

    fn remap_ids(ids: &BTreeSet<Uuid>, id_map: &HashMap<Uuid, Uuid>) -> BTreeSet<Uuid> {
        ids.iter()
            .map(|id| id_map.get(id).copied().unwrap_or(*id))
            .collect()
    }

    /// Import an observable from another root, rewriting its graph
    /// references through `id_map`.
    fn import_observable(
        &mut self,
        source: &Observable,
        target_uuid: Uuid,
        id_map: &HashMap<Uuid, Uuid>,
    ) {
        let mut copy = source.clone();
        copy.uuid = target_uuid;
        copy.request_tracking.clear();
        copy.links = Self::remap_ids(&copy.links, id_map);
        copy.redirection = copy
            .redirection
            .map(|id| id_map.get(&id).copied().unwrap_or(id));
        for ids in copy.relationships.values_mut() {
            *ids = Self::remap_ids(ids, id_map);
        }
        for analysis in copy.analysis.values_mut() {
            analysis.observable_id = Some(target_uuid);
            analysis.observable_ids = Self::remap_ids(&analysis.observable_ids, id_map);
        }
        self.observable_store.insert(target_uuid, copy);
    }

    /// Drop graph references that do not resolve within this root. Keeps
    /// the reachability invariant after partial imports.
    fn prune_dangling_references(&mut self) {
        let known: BTreeSet<Uuid> = self.observable_store.keys().copied().collect();
        for observable in self.observable_store.values_mut() {
            observable.links.retain(|id| known.contains(id));
            if let Some(redirection) = observable.redirection {
                if !known.contains(&redirection) {
                    observable.redirection = None;
                }
            }
            for ids in observable.relationships.values_mut() {
                ids.retain(|id| known.contains(id));
            }
            for analysis in observable.analysis.values_mut() {
                analysis.observable_ids.retain(|id| known.contains(id));
            }
        }
    }

    /// Merge a duplicate submission of this root. Observables are matched
    /// by identity; analysis already present is kept, missing analysis and
    /// observables are imported.
    pub fn merge_from(&mut self, other: &RootAnalysis) {
        let id_map = self.build_id_map(other);

        for source in other.observable_store.values() {
            let target_uuid = id_map.get(&source.uuid).copied().unwrap_or(source.uuid);

            if !self.observable_store.contains_key(&target_uuid) {
                self.import_observable(source, target_uuid, &id_map);
                continue;
            }

            // pull remapped analysis entries before taking the mutable
            // borrow on the target
            let mut imported: Vec<(String, Analysis)> = Vec::new();
            for (name, analysis) in &source.analysis {
                let mut copy = analysis.clone();
                copy.observable_id = Some(target_uuid);
                copy.observable_ids = Self::remap_ids(&copy.observable_ids, &id_map);
                imported.push((name.clone(), copy));
            }
            let links = Self::remap_ids(&source.links, &id_map);

            if let Some(target) = self.observable_store.get_mut(&target_uuid) {
                target.tags.extend(source.tags.iter().cloned());
                target.directives.extend(source.directives.iter().cloned());
                target
                    .limited_analysis
                    .extend(source.limited_analysis.iter().cloned());
                target
                    .excluded_analysis
                    .extend(source.excluded_analysis.iter().cloned());
                for detection in &source.detections {
                    target.add_detection_point(detection.clone());
                }
                target.links.extend(links);
                for (name, analysis) in imported {
                    target.analysis.entry(name).or_insert(analysis);
                }
                for (name, request_id) in &source.request_tracking {
                    target
                        .request_tracking
                        .entry(name.clone())
                        .or_insert(*request_id);
                }
            }
        }

        self.tags.extend(other.tags.iter().cloned());
        for detection in &other.detections {
            if !self.detections.contains(detection) {
                self.detections.push(detection.clone());
            }
        }
        if other.analysis_cancelled {
            self.analysis_cancelled = true;
            self.analysis_cancelled_reason = other.analysis_cancelled_reason.clone();
        }
        if other.analysis_mode.is_some() {
            self.analysis_mode = other.analysis_mode.clone();
        }
        if other.details.is_some() {
            self.details = other.details.clone();
        }

        self.prune_dangling_references();
    }

    /// Merge the analysis a module produced for one observable, importing
    /// any observables the analysis generated. The observable is matched by
    /// `(type, value)` so one module execution can hydrate several roots.
    /// Returns false when the result carries no analysis for the
    /// observable.
    pub fn merge_analysis_result(
        &mut self,
        observable_type: &str,
        value: &str,
        module_name: &str,
        result: &RootAnalysis,
    ) -> bool {
        let source_obs = match result.find_observable_by_value(observable_type, value) {
            Some(obs) => obs,
            None => return false,
        };

        let source_analysis = match source_obs.analysis.get(module_name) {
            Some(analysis) => analysis.clone(),
            None => return false,
        };

        let id_map = self.build_id_map(result);

        let target_uuid = match self.find_observable_by_value(observable_type, value) {
            Some(obs) => obs.uuid,
            None => {
                let mut copy = source_obs.clone();
                copy.analysis.clear();
                copy.request_tracking.clear();
                let uuid = copy.uuid;
                self.observable_store.insert(uuid, copy);
                uuid
            }
        };

        let mut analysis = source_analysis;
        analysis.observable_id = Some(target_uuid);

        // import the observables the analysis produced
        let mut produced = BTreeSet::new();
        for source_id in &analysis.observable_ids {
            if let Some(source) = result.observable_store.get(source_id) {
                let mapped = id_map.get(source_id).copied().unwrap_or(*source_id);
                if !self.observable_store.contains_key(&mapped) {
                    self.import_observable(source, mapped, &id_map);
                }
                produced.insert(mapped);
            }
        }
        analysis.observable_ids = produced;

        if let Some(target) = self.observable_store.get_mut(&target_uuid) {
            target.analysis.insert(module_name.to_string(), analysis);
            target.request_tracking.remove(module_name);
        }

        self.prune_dangling_references();
        true
    }
}

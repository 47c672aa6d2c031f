//! Observables: single indicators `(type, value)` with metadata, graph
//! links and per-module analysis slots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::models::analysis::Analysis;

/// A marker indicating suspicious content. Presence of any detection point
/// on a completed root triggers alerting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionPoint {
    /// Human-readable description of what was detected.
    pub description: String,

    /// Optional supporting detail.
    #[serde(default)]
    pub details: Option<String>,
}

impl DetectionPoint {
    /// Create a detection point.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            details: None,
        }
    }

    /// Attach supporting detail.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// A single indicator inside a root analysis.
///
/// The pair `(type, value)` is the observable identity used for caching and
/// request deduplication; the `uuid` is only unique within one root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observable {
    /// Identifier within the owning root.
    pub uuid: Uuid,

    /// Observable type, e.g. `ipv4`, `url`, `file`.
    #[serde(rename = "type")]
    pub observable_type: String,

    /// Observable value.
    pub value: String,

    /// When the observable was seen.
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,

    /// Free-form tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Directives attached by the submitter, consumed by module gating.
    #[serde(default)]
    pub directives: BTreeSet<String>,

    /// Detection points attached directly to this observable.
    #[serde(default)]
    pub detections: Vec<DetectionPoint>,

    /// Analysis produced so far, keyed by module type name.
    #[serde(default)]
    pub analysis: HashMap<String, Analysis>,

    /// Optional redirection to another observable in the same root.
    #[serde(default)]
    pub redirection: Option<Uuid>,

    /// Graph edges to other observables in the same root. May form cycles.
    #[serde(default)]
    pub links: BTreeSet<Uuid>,

    /// When non-empty, only these module types may analyze this observable.
    #[serde(default)]
    pub limited_analysis: BTreeSet<String>,

    /// Module types that must never analyze this observable.
    #[serde(default)]
    pub excluded_analysis: BTreeSet<String>,

    /// Labeled relationships to other observables in the same root.
    #[serde(default)]
    pub relationships: HashMap<String, BTreeSet<Uuid>>,

    /// Marks the observable as a grouping target for correlation.
    #[serde(default)]
    pub grouping_target: bool,

    /// In-flight analysis requests, keyed by module type name.
    #[serde(default)]
    pub request_tracking: HashMap<String, Uuid>,
}

impl Observable {
    /// Create an observable with a fresh uuid.
    pub fn new(observable_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            observable_type: observable_type.into(),
            value: value.into(),
            time: Some(Utc::now()),
            tags: BTreeSet::new(),
            directives: BTreeSet::new(),
            detections: Vec::new(),
            analysis: HashMap::new(),
            redirection: None,
            links: BTreeSet::new(),
            limited_analysis: BTreeSet::new(),
            excluded_analysis: BTreeSet::new(),
            relationships: HashMap::new(),
            grouping_target: false,
            request_tracking: HashMap::new(),
        }
    }

    /// Attach a directive.
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.insert(directive.into());
        self
    }

    /// Attach a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// True when the identity `(type, value)` matches.
    pub fn matches_value(&self, observable_type: &str, value: &str) -> bool {
        self.observable_type == observable_type && self.value == value
    }

    /// Add a detection point to this observable.
    pub fn add_detection_point(&mut self, detection: DetectionPoint) {
        if !self.detections.contains(&detection) {
            self.detections.push(detection);
        }
    }

    /// All detection points on this observable and its analyses.
    pub fn detection_points(&self) -> Vec<&DetectionPoint> {
        let mut result: Vec<&DetectionPoint> = self.detections.iter().collect();
        for analysis in self.analysis.values() {
            result.extend(analysis.detections.iter());
        }
        result
    }
}

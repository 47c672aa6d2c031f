//! Analysis module type: the registered description of an analyzer,
//! including version, timeout and cache policy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::constants::{DEFAULT_AMT_TIMEOUT, DEFAULT_AMT_VERSION};
use crate::models::observable::Observable;

fn default_version() -> String {
    DEFAULT_AMT_VERSION.to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_AMT_TIMEOUT
}

/// Registered description of an analysis module.
///
/// The `name` is the module identity. Version and extended version gate
/// which workers may receive work for this module, and the cache fields
/// control result reuse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisModuleType {
    /// Unique, non-empty module name.
    pub name: String,

    /// Free-form description.
    #[serde(default)]
    pub description: String,

    /// Observable types this module accepts. Empty means any.
    #[serde(default)]
    pub observable_types: BTreeSet<String>,

    /// Directives an observable must carry to be analyzed by this module.
    #[serde(default)]
    pub directives: BTreeSet<String>,

    /// Module names that must have analyzed an observable first.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,

    /// Tags applied by this module.
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Root analysis modes under which this module runs. Empty means all.
    #[serde(default)]
    pub modes: BTreeSet<String>,

    /// Module version. Workers must match this exactly when polling.
    #[serde(default = "default_version")]
    pub version: String,

    /// Per-request processing deadline in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Result cache lifetime in seconds. Absent disables caching.
    #[serde(default)]
    pub cache_ttl: Option<u64>,

    /// Additional values rotated into the cache key. Order is significant.
    #[serde(default)]
    pub additional_cache_keys: Vec<String>,

    /// Opaque version strings (e.g. signature database identifiers) gating
    /// worker compatibility. Order is significant for the cache key.
    #[serde(default)]
    pub extended_version: Vec<String>,
}

impl AnalysisModuleType {
    /// Create a module type with defaults for everything but the name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            observable_types: BTreeSet::new(),
            directives: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            tags: BTreeSet::new(),
            modes: BTreeSet::new(),
            version: default_version(),
            timeout: default_timeout(),
            cache_ttl: None,
            additional_cache_keys: Vec::new(),
            extended_version: Vec::new(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the module version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the processing timeout in seconds.
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable result caching with the given lifetime in seconds.
    pub fn with_cache_ttl(mut self, cache_ttl: u64) -> Self {
        self.cache_ttl = Some(cache_ttl);
        self
    }

    /// Restrict the module to the given observable types.
    pub fn with_observable_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.observable_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Require the given directives on analyzed observables.
    pub fn with_directives<I, S>(mut self, directives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.directives = directives.into_iter().map(Into::into).collect();
        self
    }

    /// Require the given module dependencies.
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict the module to the given analysis modes.
    pub fn with_modes<I, S>(mut self, modes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modes = modes.into_iter().map(Into::into).collect();
        self
    }

    /// Add an additional cache key component.
    pub fn with_additional_cache_key(mut self, key: impl Into<String>) -> Self {
        self.additional_cache_keys.push(key.into());
        self
    }

    /// Set the extended version list.
    pub fn with_extended_version<I, S>(mut self, extended: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extended_version = extended.into_iter().map(Into::into).collect();
        self
    }

    /// True when results of this module are cachable.
    pub fn is_cachable(&self) -> bool {
        self.cache_ttl.is_some()
    }

    /// Check a worker's version claim against this registration.
    ///
    /// The version must match exactly and every extended version element
    /// the worker supplies must be present in the registered list.
    pub fn version_matches(&self, version: &str, extended_version: &[String]) -> bool {
        if self.version != version {
            return false;
        }

        extended_version
            .iter()
            .all(|item| self.extended_version.contains(item))
    }

    /// Decide whether this module applies to the given observable within the
    /// given analysis mode.
    ///
    /// An observable is eligible when its type is accepted, it carries every
    /// required directive, every dependency has already produced analysis,
    /// the module is not excluded (and is included when a limit set exists),
    /// and the root's mode is one the module runs under. Observables that
    /// already carry analysis from this module, or that have a request in
    /// flight for it, are never eligible.
    pub fn accepts(&self, observable: &Observable, analysis_mode: Option<&str>) -> bool {
        if observable.analysis.contains_key(&self.name) {
            return false;
        }

        if observable.request_tracking.contains_key(&self.name) {
            return false;
        }

        if !self.observable_types.is_empty()
            && !self.observable_types.contains(&observable.observable_type)
        {
            return false;
        }

        if !self
            .directives
            .iter()
            .all(|directive| observable.directives.contains(directive))
        {
            return false;
        }

        if observable.excluded_analysis.contains(&self.name) {
            return false;
        }

        if !observable.limited_analysis.is_empty()
            && !observable.limited_analysis.contains(&self.name)
        {
            return false;
        }

        if !self
            .dependencies
            .iter()
            .all(|dep| observable.analysis.contains_key(dep))
        {
            return false;
        }

        if !self.modes.is_empty() {
            match analysis_mode {
                Some(mode) if self.modes.contains(mode) => {}
                _ => return false,
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::analysis::Analysis;

    fn observable(observable_type: &str, value: &str) -> Observable {
        Observable::new(observable_type, value)
    }

    #[test]
    fn test_defaults() {
        let amt = AnalysisModuleType::new("test");
        assert_eq!(amt.version, "1.0.0");
        assert_eq!(amt.timeout, 30);
        assert!(amt.cache_ttl.is_none());
        assert!(!amt.is_cachable());
    }

    #[test]
    fn test_version_matches_exact() {
        let amt = AnalysisModuleType::new("test").with_version("1.0.0");
        assert!(amt.version_matches("1.0.0", &[]));
        assert!(!amt.version_matches("1.0.1", &[]));
    }

    #[test]
    fn test_version_matches_extended() {
        let amt = AnalysisModuleType::new("test")
            .with_extended_version(["sigs:2024-01-01", "engine:5"]);
        assert!(amt.version_matches("1.0.0", &[]));
        assert!(amt.version_matches("1.0.0", &["sigs:2024-01-01".to_string()]));
        assert!(!amt.version_matches("1.0.0", &["sigs:1999-01-01".to_string()]));
    }

    #[test]
    fn test_accepts_observable_type_gate() {
        let amt = AnalysisModuleType::new("test").with_observable_types(["ipv4"]);
        assert!(amt.accepts(&observable("ipv4", "1.2.3.4"), None));
        assert!(!amt.accepts(&observable("url", "http://localhost/"), None));

        // an empty type set accepts anything
        let open = AnalysisModuleType::new("open");
        assert!(open.accepts(&observable("url", "http://localhost/"), None));
    }

    #[test]
    fn test_accepts_directive_gate() {
        let amt = AnalysisModuleType::new("test").with_directives(["crawl"]);
        let mut obs = observable("url", "http://localhost/");
        assert!(!amt.accepts(&obs, None));

        obs.directives.insert("crawl".to_string());
        assert!(amt.accepts(&obs, None));
    }

    #[test]
    fn test_accepts_exclusion_and_limits() {
        let amt = AnalysisModuleType::new("test");

        let mut obs = observable("test", "test");
        obs.excluded_analysis.insert("test".to_string());
        assert!(!amt.accepts(&obs, None));

        let mut obs = observable("test", "test");
        obs.limited_analysis.insert("other".to_string());
        assert!(!amt.accepts(&obs, None));

        obs.limited_analysis.insert("test".to_string());
        assert!(amt.accepts(&obs, None));
    }

    #[test]
    fn test_accepts_dependency_gate() {
        let amt = AnalysisModuleType::new("second").with_dependencies(["first"]);
        let mut obs = observable("test", "test");
        assert!(!amt.accepts(&obs, None));

        obs.analysis
            .insert("first".to_string(), Analysis::new("first", obs.uuid));
        assert!(amt.accepts(&obs, None));
    }

    #[test]
    fn test_accepts_mode_gate() {
        let amt = AnalysisModuleType::new("test").with_modes(["detect"]);
        let obs = observable("test", "test");
        assert!(!amt.accepts(&obs, None));
        assert!(!amt.accepts(&obs, Some("correlate")));
        assert!(amt.accepts(&obs, Some("detect")));
    }

    #[test]
    fn test_accepts_skips_analyzed_and_tracked() {
        let amt = AnalysisModuleType::new("test");

        let mut obs = observable("test", "test");
        obs.analysis
            .insert("test".to_string(), Analysis::new("test", obs.uuid));
        assert!(!amt.accepts(&obs, None));

        let mut obs = observable("test", "test");
        obs.request_tracking
            .insert("test".to_string(), uuid::Uuid::new_v4());
        assert!(!amt.accepts(&obs, None));
    }

    #[test]
    fn test_serde_round_trip() {
        let amt = AnalysisModuleType::new("hasher")
            .with_description("hashes things")
            .with_version("2.1.0")
            .with_cache_ttl(600)
            .with_observable_types(["file"])
            .with_extended_version(["sigs:1"]);

        let encoded = serde_json::to_string(&amt).unwrap();
        let decoded: AnalysisModuleType = serde_json::from_str(&encoded).unwrap();
        assert_eq!(amt, decoded);
    }
}

//! Central error taxonomy for the core.
//!
//! Each variant is a distinct failure kind with a stable wire code used by
//! the HTTP error envelope. Internal invariant violations surface as
//! [`CoreError::Invariant`] so they fail the request loudly instead of
//! corrupting persisted state.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// An operation referenced an analysis module type that is not
    /// registered.
    #[error("unknown analysis module type: {0}")]
    UnknownAnalysisModuleType(String),

    /// An analysis module type was registered with a dependency that is not
    /// itself registered.
    #[error("analysis module type {amt} depends on unknown module type {dependency}")]
    AmtDependency {
        /// Name of the module type being registered.
        amt: String,
        /// Name of the missing dependency.
        dependency: String,
    },

    /// A worker polled for work with a version that does not match the
    /// registered module type.
    #[error("version mismatch for analysis module type {amt}: registered {registered}, requested {requested}")]
    AmtVersion {
        /// Name of the module type.
        amt: String,
        /// Currently registered version.
        registered: String,
        /// Version supplied by the worker.
        requested: String,
    },

    /// An analysis module type failed validation at registration.
    #[error("invalid analysis module type: {0}")]
    InvalidModuleType(String),

    /// An operation referenced a root analysis that is not tracked.
    #[error("unknown root analysis: {0}")]
    UnknownRootAnalysis(Uuid),

    /// An alerting operation referenced an unregistered alert system.
    #[error("unknown alert system: {0}")]
    UnknownAlertSystem(String),

    /// An api key was created with a name that is already in use.
    #[error("duplicate api key name: {0}")]
    DuplicateApiKeyName(String),

    /// An optimistic root update exhausted its retry attempts.
    #[error("root version conflict for {0} after retries")]
    RootVersionConflict(Uuid),

    /// The persistence backend reported a deadlock and retries were
    /// exhausted.
    #[error("backend deadlock after {0} attempts")]
    Deadlock(u32),

    /// A broken internal invariant. These crash the request and are logged;
    /// they never silently corrupt persisted state.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// Filesystem failure in the blob store.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Stable wire code for the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::UnknownAnalysisModuleType(_) => "UNKNOWN_AMT",
            CoreError::AmtDependency { .. } => "AMT_DEP",
            CoreError::AmtVersion { .. } => "AMT_VERSION",
            CoreError::InvalidModuleType(_) => "INVALID_AMT",
            CoreError::UnknownRootAnalysis(_) => "UNKNOWN_ROOT",
            CoreError::UnknownAlertSystem(_) => "UNKNOWN_ALERT_SYSTEM",
            CoreError::DuplicateApiKeyName(_) => "DUPLICATE_API_KEY_NAME",
            CoreError::RootVersionConflict(_) => "ROOT_VERSION",
            CoreError::Deadlock(_) => "DEADLOCK",
            CoreError::Invariant(_) => "INTERNAL",
            CoreError::Io(_) => "IO_ERROR",
            CoreError::Serialization(_) => "SERIALIZATION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            CoreError::UnknownAnalysisModuleType("x".to_string()).code(),
            "UNKNOWN_AMT"
        );
        assert_eq!(
            CoreError::AmtDependency {
                amt: "a".to_string(),
                dependency: "b".to_string(),
            }
            .code(),
            "AMT_DEP"
        );
        assert_eq!(
            CoreError::AmtVersion {
                amt: "a".to_string(),
                registered: "1.0.0".to_string(),
                requested: "1.0.1".to_string(),
            }
            .code(),
            "AMT_VERSION"
        );
        assert_eq!(
            CoreError::DuplicateApiKeyName("key".to_string()).code(),
            "DUPLICATE_API_KEY_NAME"
        );
    }

    #[test]
    fn test_error_display_includes_context() {
        let err = CoreError::AmtVersion {
            amt: "hasher".to_string(),
            registered: "1.0.0".to_string(),
            requested: "1.0.1".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("hasher"));
        assert!(message.contains("1.0.0"));
        assert!(message.contains("1.0.1"));
    }
}

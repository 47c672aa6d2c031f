//! Metadata for content-addressed blobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Metadata describing stored content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentMetadata {
    /// Lowercase hex sha256 of the content; the storage address.
    pub sha256: String,

    /// Original file name.
    pub name: String,

    /// Content size in bytes.
    pub size: u64,

    /// Filesystem location of the stored bytes.
    pub location: PathBuf,

    /// When the content was stored.
    pub insert_date: DateTime<Utc>,

    /// When the content becomes eligible for garbage collection. Absent
    /// means the content never expires.
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,

    /// Opaque custom metadata supplied by the submitter.
    #[serde(default)]
    pub custom: Option<serde_json::Value>,

    /// Roots pinning this content. A blob with referring roots is never
    /// garbage collected.
    #[serde(default)]
    pub roots: Vec<Uuid>,
}

impl ContentMetadata {
    /// True when the expiration date has passed and no roots pin the
    /// content.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiration_date {
            Some(expiration) => expiration <= now && self.roots.is_empty(),
            None => false,
        }
    }
}

/// Caller-supplied description of content being stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentSpec {
    /// File name to record.
    pub name: String,

    /// Optional expiration date.
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,

    /// Opaque custom metadata.
    #[serde(default)]
    pub custom: Option<serde_json::Value>,
}

impl ContentSpec {
    /// Create a spec with just a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expiration_date: None,
            custom: None,
        }
    }

    /// Set the expiration date.
    pub fn with_expiration(mut self, expiration_date: DateTime<Utc>) -> Self {
        self.expiration_date = Some(expiration_date);
        self
    }
}

//! Api key records. The secret is hashed at rest; only the creation call
//! ever sees the clear value.

use serde::{Deserialize, Serialize};

/// A stored api key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    /// sha256 hex of the key value.
    pub api_key: String,

    /// Unique name of the key.
    pub name: String,

    /// Optional description.
    #[serde(default)]
    pub description: Option<String>,

    /// Whether this key grants admin endpoints.
    #[serde(default)]
    pub is_admin: bool,
}

impl ApiKey {
    /// Create a key record from an already-hashed value.
    pub fn new(api_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            name: name.into(),
            description: None,
            is_admin: false,
        }
    }
}

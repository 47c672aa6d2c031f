//! Configuration settings keyed by dotted path strings, with per-key
//! environment variable overrides resolved at read time.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

/// A stored configuration setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSetting {
    /// Dotted path key, e.g. `/ace/core/storage/path`.
    pub key: String,

    /// Setting value.
    pub value: serde_json::Value,

    /// Optional documentation for operators.
    #[serde(default)]
    pub documentation: Option<String>,
}

/// Contract for configuration persistence.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetch a setting by key.
    async fn get(&self, key: &str) -> CoreResult<Option<ConfigurationSetting>>;

    /// Store a setting.
    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        documentation: Option<String>,
    ) -> CoreResult<()>;

    /// Delete a setting. Returns false when absent.
    async fn delete(&self, key: &str) -> CoreResult<bool>;

    /// Remove every setting.
    async fn reset(&self) -> CoreResult<()>;
}

/// In-memory configuration store.
pub struct MemoryConfigStore {
    settings: DashMap<String, ConfigurationSetting>,
}

impl MemoryConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            settings: DashMap::new(),
        }
    }
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, key: &str) -> CoreResult<Option<ConfigurationSetting>> {
        Ok(self.settings.get(key).map(|entry| entry.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        documentation: Option<String>,
    ) -> CoreResult<()> {
        self.settings.insert(
            key.to_string(),
            ConfigurationSetting {
                key: key.to_string(),
                value,
                documentation,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoreResult<bool> {
        Ok(self.settings.remove(key).is_some())
    }

    async fn reset(&self) -> CoreResult<()> {
        self.settings.clear();
        Ok(())
    }
}

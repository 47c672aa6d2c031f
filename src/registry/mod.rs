//! Module registry: the canonical record of analysis module types.
//!
//! Registration events, dependency validation and the deletion cascade are
//! orchestrated by the system layer; this store only owns the records.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{CoreError, CoreResult};
use crate::models::AnalysisModuleType;

/// Contract for the analysis module type registry.
#[async_trait]
pub trait ModuleRegistry: Send + Sync {
    /// Insert or replace the record for a module type.
    async fn track(&self, module_type: &AnalysisModuleType) -> CoreResult<()>;

    /// Look up a module type by name.
    async fn get(&self, name: &str) -> CoreResult<Option<AnalysisModuleType>>;

    /// Delete a module type record. Returns false when absent.
    async fn delete(&self, name: &str) -> CoreResult<bool>;

    /// All registered module types.
    async fn list(&self) -> CoreResult<Vec<AnalysisModuleType>>;

    /// Remove every registered module type.
    async fn reset(&self) -> CoreResult<()>;
}

/// In-memory module registry.
pub struct MemoryModuleRegistry {
    modules: DashMap<String, AnalysisModuleType>,
}

impl MemoryModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            modules: DashMap::new(),
        }
    }
}

impl Default for MemoryModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModuleRegistry for MemoryModuleRegistry {
    async fn track(&self, module_type: &AnalysisModuleType) -> CoreResult<()> {
        if module_type.name.is_empty() {
            return Err(CoreError::InvalidModuleType(
                "module type name must be non-empty".to_string(),
            ));
        }

        self.modules
            .insert(module_type.name.clone(), module_type.clone());
        Ok(())
    }

    async fn get(&self, name: &str) -> CoreResult<Option<AnalysisModuleType>> {
        Ok(self.modules.get(name).map(|entry| entry.clone()))
    }

    async fn delete(&self, name: &str) -> CoreResult<bool> {
        Ok(self.modules.remove(name).is_some())
    }

    async fn list(&self) -> CoreResult<Vec<AnalysisModuleType>> {
        Ok(self
            .modules
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn reset(&self) -> CoreResult<()> {
        self.modules.clear();
        Ok(())
    }
}

//! Engine Registry
//!
//! The registry is the catalog of engine descriptors. It is an explicit
//! object handed to the lifecycle manager and the orchestrator; it never
//! holds engine instances.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::core::error::{Result, TtsError};
use super::descriptor::{EngineDescriptor, EngineKind};

/// Catalog of engine descriptors keyed by id
#[derive(Default)]
pub struct EngineRegistry {
    descriptors: RwLock<HashMap<String, Arc<EngineDescriptor>>>,
}

impl EngineRegistry {
    /// Create a new engine registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor; ids are unique
    pub fn register(&self, descriptor: EngineDescriptor) -> Result<Arc<EngineDescriptor>> {
        let mut descriptors = self
            .descriptors
            .write()
            .map_err(|_| TtsError::lock_poisoned("EngineRegistry::register"))?;

        if descriptors.contains_key(&descriptor.id) {
            return Err(TtsError::Config {
                message: format!("engine '{}' is already registered", descriptor.id),
                path: None,
            });
        }

        debug!(
            "Registered engine {} (strategies: {:?})",
            descriptor.id,
            descriptor.strategy_names()
        );
        let descriptor = Arc::new(descriptor);
        descriptors.insert(descriptor.id.clone(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Unregister an engine
    pub fn unregister(&self, id: &str) -> Result<Option<Arc<EngineDescriptor>>> {
        Ok(self
            .descriptors
            .write()
            .map_err(|_| TtsError::lock_poisoned("EngineRegistry::unregister"))?
            .remove(id))
    }

    /// Look up a descriptor
    pub fn get(&self, id: &str) -> Result<Arc<EngineDescriptor>> {
        self.descriptors
            .read()
            .map_err(|_| TtsError::lock_poisoned("EngineRegistry::get"))?
            .get(id)
            .cloned()
            .ok_or_else(|| TtsError::UnknownEngine {
                engine_id: id.to_string(),
            })
    }

    /// Check if an engine is registered
    pub fn is_registered(&self, id: &str) -> bool {
        self.descriptors
            .read()
            .map(|d| d.contains_key(id))
            .unwrap_or(false)
    }

    /// All descriptors, sorted by id
    pub fn list(&self) -> Result<Vec<Arc<EngineDescriptor>>> {
        let descriptors = self
            .descriptors
            .read()
            .map_err(|_| TtsError::lock_poisoned("EngineRegistry::list"))?;
        let mut list: Vec<_> = descriptors.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    /// Inference descriptors only, sorted by id
    pub fn list_inference(&self) -> Result<Vec<Arc<EngineDescriptor>>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|d| d.kind == EngineKind::Inference)
            .collect())
    }

    pub fn len(&self) -> usize {
        self.descriptors.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Distributed model registry
//!
//! Bookkeeping for models registered for distributed execution. Indices are
//! monotonic in registration order and are the only cross-process model
//! identifier (`model_<index>` on the wire). The mirroring RPCs themselves
//! are driven by the [`Fleet`](crate::Fleet) context; this registry records
//! which workers accepted each model.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use fleet_core::engine::EngineModel;
use fleet_core::{Error, Result};

/// A model registered for distributed execution
pub struct RegisteredModel {
    /// Stable index, assigned in registration order
    pub index: u32,

    /// In-process engine handle; local shards execute against this
    pub handle: Arc<dyn EngineModel>,

    /// Workers holding a mirrored copy of the weights
    pub mirrored_on: HashSet<String>,
}

/// Registry of models available for distributed execution
pub struct ModelRegistry {
    models: RwLock<Vec<RegisteredModel>>,
}

impl ModelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            models: RwLock::new(Vec::new()),
        }
    }

    /// Append a model; the returned index is its wire identifier
    pub fn append(&self, handle: Arc<dyn EngineModel>) -> u32 {
        let mut models = self.models.write();
        let index = models.len() as u32;
        models.push(RegisteredModel {
            index,
            handle,
            mirrored_on: HashSet::new(),
        });
        index
    }

    /// Record that a worker accepted this model's weights
    pub fn mark_mirrored(&self, index: u32, worker: &str) -> Result<()> {
        let mut models = self.models.write();
        let model = models
            .get_mut(index as usize)
            .ok_or(Error::ModelNotFound { index })?;
        model.mirrored_on.insert(worker.to_string());
        Ok(())
    }

    /// The in-process handle for a model
    pub fn get(&self, index: u32) -> Result<Arc<dyn EngineModel>> {
        self.models
            .read()
            .get(index as usize)
            .map(|m| m.handle.clone())
            .ok_or(Error::ModelNotFound { index })
    }

    /// Workers holding a mirrored copy of a model
    pub fn mirrored_on(&self, index: u32) -> Result<HashSet<String>> {
        self.models
            .read()
            .get(index as usize)
            .map(|m| m.mirrored_on.clone())
            .ok_or(Error::ModelNotFound { index })
    }

    /// Number of registered models
    pub fn count(&self) -> usize {
        self.models.read().len()
    }

    /// (index, mirrored workers) for every registered model, mirrored
    /// worker names sorted for stable output
    pub fn summaries(&self) -> Vec<(u32, Vec<String>)> {
        self.models
            .read()
            .iter()
            .map(|m| {
                let mut workers: Vec<String> = m.mirrored_on.iter().cloned().collect();
                workers.sort();
                (m.index, workers)
            })
            .collect()
    }

    /// Clear all registered models.
    ///
    /// Local bookkeeping only: remote workers keep their mirrored weights
    /// until overwritten by a later registration.
    pub fn cleanup(&self) {
        let mut models = self.models.write();
        info!(model_count = models.len(), "Cleaning up registered models");
        models.clear();
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::engine::linear::LinearModel;

    fn model() -> Arc<dyn EngineModel> {
        Arc::new(LinearModel::from_state(&[1.0, 0.0]).unwrap())
    }

    #[test]
    fn test_indices_are_monotonic() {
        let registry = ModelRegistry::new();
        assert_eq!(registry.append(model()), 0);
        assert_eq!(registry.append(model()), 1);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn test_mirroring_bookkeeping() {
        let registry = ModelRegistry::new();
        let index = registry.append(model());

        registry.mark_mirrored(index, "localhost").unwrap();
        registry.mark_mirrored(index, "remote1").unwrap();

        let mirrored = registry.mirrored_on(index).unwrap();
        assert!(mirrored.contains("localhost"));
        assert!(mirrored.contains("remote1"));
        assert_eq!(mirrored.len(), 2);
    }

    #[test]
    fn test_unknown_index() {
        let registry = ModelRegistry::new();
        assert!(matches!(
            registry.get(3),
            Err(Error::ModelNotFound { index: 3 })
        ));
        assert!(registry.mark_mirrored(0, "localhost").is_err());
    }

    #[test]
    fn test_cleanup_clears_everything() {
        let registry = ModelRegistry::new();
        registry.append(model());
        registry.append(model());

        registry.cleanup();
        assert_eq!(registry.count(), 0);

        // Indices restart after cleanup
        assert_eq!(registry.append(model()), 0);
    }
}

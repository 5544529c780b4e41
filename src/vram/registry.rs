//! # Loaded Model Registry
//!
//! Bookkeeping for the set of models the orchestrator believes occupy GPU
//! memory. The registry is plain data guarded by the orchestrator mutex; it
//! performs no I/O. External models are tracked for visibility but excluded
//! from the manageable usage total that budget decisions are made against.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::capabilities::{BackendKind, ModelPriority};

/// A model currently registered as resident.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub model_id: String,
    pub backend: BackendKind,
    pub size_gb: f64,
    pub priority: ModelPriority,
    pub is_external: bool,
    pub loaded_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: HashMap<String, LoadedModel>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    pub fn get(&self, model_id: &str) -> Option<&LoadedModel> {
        self.models.get(model_id)
    }

    /// Register a model as resident. A model appears at most once; a repeat
    /// registration refreshes the timestamps.
    pub fn register(
        &mut self,
        model_id: &str,
        backend: BackendKind,
        size_gb: f64,
        priority: ModelPriority,
        is_external: bool,
    ) {
        let now = Utc::now();
        self.models.insert(
            model_id.to_string(),
            LoadedModel {
                model_id: model_id.to_string(),
                backend,
                size_gb,
                priority,
                is_external,
                loaded_at: now,
                last_accessed: now,
            },
        );
    }

    /// Remove a model. Returns the record if it was present, so unregistering
    /// twice is a no-op the caller can observe.
    pub fn unregister(&mut self, model_id: &str) -> Option<LoadedModel> {
        self.models.remove(model_id)
    }

    /// Refresh the LRU timestamp.
    pub fn update_access(&mut self, model_id: &str) {
        if let Some(model) = self.models.get_mut(model_id) {
            model.last_accessed = Utc::now();
        }
    }

    pub fn all(&self) -> &HashMap<String, LoadedModel> {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Total VRAM of everything tracked, external models included.
    pub fn total_usage_gb(&self) -> f64 {
        self.models.values().map(|m| m.size_gb).sum()
    }

    /// VRAM the orchestrator is permitted to reclaim: everything non-external.
    pub fn manageable_usage_gb(&self) -> f64 {
        self.models
            .values()
            .filter(|m| !m.is_external)
            .map(|m| m.size_gb)
            .sum()
    }

    /// Loaded models of a given backend kind.
    pub fn by_backend(&self, backend: BackendKind) -> Vec<&LoadedModel> {
        self.models
            .values()
            .filter(|m| m.backend == backend)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_usage_totals() {
        let mut registry = ModelRegistry::new();
        registry.register("a", BackendKind::Ollama, 20.0, ModelPriority::Normal, false);
        registry.register("b", BackendKind::Ollama, 30.0, ModelPriority::High, false);
        registry.register("ext", BackendKind::Sglang, 80.0, ModelPriority::High, true);

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.total_usage_gb(), 130.0);
        assert_eq!(registry.manageable_usage_gb(), 50.0);
    }

    #[test]
    fn test_double_unregister_is_noop() {
        let mut registry = ModelRegistry::new();
        registry.register("a", BackendKind::Ollama, 20.0, ModelPriority::Normal, false);

        assert!(registry.unregister("a").is_some());
        assert!(registry.unregister("a").is_none());
        assert_eq!(registry.total_usage_gb(), 0.0);
    }

    #[test]
    fn test_update_access_moves_timestamp_forward() {
        let mut registry = ModelRegistry::new();
        registry.register("a", BackendKind::Ollama, 20.0, ModelPriority::Normal, false);
        let before = registry.get("a").unwrap().last_accessed;

        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.update_access("a");

        assert!(registry.get("a").unwrap().last_accessed > before);
    }

    #[test]
    fn test_by_backend_filters() {
        let mut registry = ModelRegistry::new();
        registry.register("a", BackendKind::Ollama, 20.0, ModelPriority::Normal, false);
        registry.register("b", BackendKind::Vllm, 30.0, ModelPriority::Normal, false);

        let ollama = registry.by_backend(BackendKind::Ollama);
        assert_eq!(ollama.len(), 1);
        assert_eq!(ollama[0].model_id, "a");
    }
}

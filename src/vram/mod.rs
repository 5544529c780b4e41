//! # VRAM Orchestrator
//!
//! Authority over which models occupy GPU memory. Serializes and governs all
//! load/unload decisions so the set of resident models fits the active
//! profile's hard budget, maximizing cache hits under a priority-bounded LRU
//! discipline. Composed of the loaded-model registry, memory monitor,
//! eviction strategy, backend manager, and crash tracker.
//!
//! Admission is optimistic: a successful `request_model_load` reserves the
//! budget slot in the registry; the backend performs the actual load on the
//! next generation. Reconciliation exists to realign the registry with
//! backend reality when models die outside our control.

pub mod crash;
pub mod eviction;
pub mod memory;
pub mod registry;

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backends::BackendManager;
use crate::capabilities::{BackendKind, CapabilityRegistry, ModelPriority};
use crate::error::GatewayError;

pub use crash::{CrashAlert, CrashStats, CrashTracker};
pub use eviction::PriorityLruEviction;
pub use memory::{FixedMemoryMonitor, MemoryMonitor, MemoryStatus, SystemMemoryMonitor};
pub use registry::{LoadedModel, ModelRegistry};

/// Large loads are sensitive to filesystem cache pressure; flush above this.
const CACHE_FLUSH_THRESHOLD_GB: f64 = 70.0;

/// Breaker and budget parameters, fixed at construction.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub soft_limit_gb: f64,
    pub hard_limit_gb: f64,
    pub circuit_breaker_enabled: bool,
    pub circuit_breaker_buffer_gb: f64,
}

/// State guarded by the single orchestrator-wide mutex.
struct OrchestratorState {
    registry: ModelRegistry,
    soft_limit_gb: f64,
    hard_limit_gb: f64,
}

/// Reconciliation outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileStats {
    pub registry_count: usize,
    pub backend_count: usize,
    pub cleaned_count: usize,
    pub cleaned_models: Vec<String>,
}

/// Emergency eviction outcome.
#[derive(Debug, Clone, Serialize)]
pub struct EvictionOutcome {
    pub evicted: bool,
    pub model_id: Option<String>,
    pub size_gb: f64,
    pub reason: String,
}

/// Deep-copied status for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub memory: MemorySection,
    pub loaded_models: Vec<LoadedModelStatus>,
    pub crash_tracker: Vec<CrashStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemorySection {
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub total_model_vram_gb: f64,
    pub manageable_vram_gb: f64,
    pub soft_limit_gb: f64,
    pub hard_limit_gb: f64,
    /// Percentage of the hard limit consumed by manageable models only.
    pub usage_pct: f64,
    pub psi_some_avg10: f64,
    pub psi_full_avg10: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadedModelStatus {
    pub model_id: String,
    pub backend: String,
    pub size_gb: f64,
    pub priority: String,
    pub is_external: bool,
    pub loaded_at: String,
    pub last_accessed: String,
}

pub struct VramOrchestrator {
    state: Mutex<OrchestratorState>,
    capabilities: Arc<CapabilityRegistry>,
    memory: Arc<dyn MemoryMonitor>,
    eviction: PriorityLruEviction,
    backends: Arc<BackendManager>,
    crash_tracker: Arc<CrashTracker>,
    circuit_breaker_enabled: bool,
    circuit_breaker_buffer_gb: f64,
}

impl VramOrchestrator {
    pub fn new(
        capabilities: Arc<CapabilityRegistry>,
        memory: Arc<dyn MemoryMonitor>,
        backends: Arc<BackendManager>,
        crash_tracker: Arc<CrashTracker>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            state: Mutex::new(OrchestratorState {
                registry: ModelRegistry::new(),
                soft_limit_gb: settings.soft_limit_gb,
                hard_limit_gb: settings.hard_limit_gb,
            }),
            capabilities,
            memory,
            eviction: PriorityLruEviction::new(),
            backends,
            crash_tracker,
            circuit_breaker_enabled: settings.circuit_breaker_enabled,
            circuit_breaker_buffer_gb: settings.circuit_breaker_buffer_gb,
        }
    }

    pub fn crash_tracker(&self) -> &Arc<CrashTracker> {
        &self.crash_tracker
    }

    /// Update limits at runtime. Called by profile switches so orchestrator
    /// budgets stay in sync with the active profile.
    pub async fn update_limits(&self, soft_limit_gb: f64, hard_limit_gb: f64) {
        let mut state = self.state.lock().await;
        info!(
            "🔄 VRAM limits updated: soft={:.0}GB→{:.0}GB, hard={:.0}GB→{:.0}GB",
            state.soft_limit_gb, soft_limit_gb, state.hard_limit_gb, hard_limit_gb
        );
        state.soft_limit_gb = soft_limit_gb;
        state.hard_limit_gb = hard_limit_gb;
    }

    /// Coordinate a model load with memory management. Reserves the budget
    /// slot; the backend driver performs the actual load lazily.
    pub async fn request_model_load(&self, model_id: &str) -> Result<(), GatewayError> {
        let mut state = self.state.lock().await;

        // 1. Fast-path cache hit: refresh LRU and return. External models
        // take the same short-circuit; their lifecycle is not ours to drive.
        if state.registry.is_loaded(model_id) {
            debug!("♻️  {} already loaded", model_id);
            state.registry.update_access(model_id);
            return Ok(());
        }

        // 2. Resolve capabilities.
        let caps = self.capabilities.require(model_id)?.clone();
        let required_gb = caps.vram_size_gb;
        let backend_kind = caps.backend.kind;
        let priority = caps.priority;

        // 3. Circuit breaker: a recently crashing model only loads with extra
        // headroom carved out in advance.
        if self.circuit_breaker_enabled && self.crash_tracker.needs_protection(model_id) {
            let crash_count = self.crash_tracker.crash_count(model_id);
            warn!(
                "🔄 Circuit breaker triggered for {}: {} crashes in last {}s, evicting for headroom",
                model_id,
                crash_count,
                self.crash_tracker.window_seconds()
            );
            self.breaker_preload_eviction(&mut state, model_id, required_gb)
                .await?;
        }

        // 4. Large-model cache flush, skipped for externally hosted models.
        if required_gb > CACHE_FLUSH_THRESHOLD_GB && !caps.is_external {
            info!(
                "💾 Large model detected ({:.1}GB), flushing buffer cache",
                required_gb
            );
            if let Err(e) = self.memory.flush_cache().await {
                warn!("buffer cache flush failed: {}", e);
            }
        }

        // 5. Capacity check against manageable usage only.
        let manageable = state.registry.manageable_usage_gb();
        let projected = manageable + required_gb;
        debug!(
            "VRAM usage: {:.1}GB manageable ({:.1}GB total), projected {:.1}GB with {} (limit {:.1}GB)",
            manageable,
            state.registry.total_usage_gb(),
            projected,
            model_id,
            state.hard_limit_gb
        );

        if projected > state.hard_limit_gb {
            warn!(
                "⚠️  Projected usage {:.1}GB exceeds hard limit {:.1}GB",
                projected, state.hard_limit_gb
            );

            // 6. Victim selection.
            let victims = self.eviction.select_victims(
                state.registry.all(),
                required_gb,
                manageable,
                state.hard_limit_gb,
            );
            if victims.is_empty() {
                return Err(GatewayError::Memory(format!(
                    "cannot free enough memory for {} ({:.1}GB): all models are protected or insufficient space",
                    model_id, required_gb
                )));
            }

            // 7. Perform evictions; a single failure is logged and skipped.
            for victim_id in victims {
                self.evict_locked(&mut state, &victim_id).await;
            }

            let manageable_after = state.registry.manageable_usage_gb();
            if manageable_after + required_gb > state.hard_limit_gb {
                return Err(GatewayError::Memory(format!(
                    "eviction failed to free enough memory for {} ({:.1}GB still over the {:.1}GB limit)",
                    model_id,
                    manageable_after + required_gb - state.hard_limit_gb,
                    state.hard_limit_gb
                )));
            }
        }

        // 8. Reserve the slot.
        state
            .registry
            .register(model_id, backend_kind, required_gb, priority, caps.is_external);
        info!(
            "✅ Registered {} (size={:.1}GB, priority={})",
            model_id,
            required_gb,
            priority.as_str()
        );
        Ok(())
    }

    /// Proactive eviction before loading a crash-prone model: free
    /// `required + buffer` GB by evicting NORMAL/LOW models in LRU order.
    async fn breaker_preload_eviction(
        &self,
        state: &mut OrchestratorState,
        model_id: &str,
        required_gb: f64,
    ) -> Result<(), GatewayError> {
        let target_free_gb = required_gb + self.circuit_breaker_buffer_gb;
        let current_free = self
            .memory
            .status()
            .await
            .map(|s| s.available_gb)
            .unwrap_or(0.0);
        if current_free >= target_free_gb {
            return Ok(());
        }

        let need_to_free = target_free_gb - current_free;
        info!(
            "📤 Circuit breaker: need to free {:.1}GB (current {:.1}GB, target {:.1}GB)",
            need_to_free, current_free, target_free_gb
        );

        let mut candidates: Vec<(String, f64)> = state
            .registry
            .all()
            .values()
            .filter(|m| m.priority >= ModelPriority::Normal && !m.is_external)
            .map(|m| (m.model_id.clone(), m.size_gb))
            .collect();
        candidates.sort_by_key(|(id, _)| state.registry.get(id).map(|m| m.last_accessed));

        let mut freed = 0.0;
        for (victim_id, size_gb) in candidates {
            if freed >= need_to_free {
                break;
            }
            if self.evict_locked(state, &victim_id).await {
                freed += size_gb;
            }
        }

        if freed < need_to_free {
            let retry_after_seconds = self.crash_tracker.suggested_wait_seconds(model_id);
            return Err(GatewayError::CircuitBreakerOpen {
                model_id: model_id.to_string(),
                retry_after_seconds,
            });
        }

        info!("✅ Circuit breaker freed {:.1}GB of headroom", freed);
        Ok(())
    }

    /// Unload one registered model; returns whether it left the registry.
    /// A failed unload keeps the entry tracked, so the caller's post-eviction
    /// limit check observes the memory that was not actually freed.
    async fn evict_locked(&self, state: &mut OrchestratorState, victim_id: &str) -> bool {
        let Some(victim) = state.registry.get(victim_id).cloned() else {
            return false;
        };
        info!(
            "📤 Evicting {} ({:.1}GB, backend={})",
            victim_id, victim.size_gb, victim.backend
        );
        match self.backends.unload(victim_id, victim.backend).await {
            Ok(()) => {
                state.registry.unregister(victim_id);
                info!("✅ Evicted {}", victim_id);
                true
            }
            Err(e) => {
                warn!("❌ Failed to evict {}: {}", victim_id, e);
                false
            }
        }
    }

    /// Refresh the LRU timestamp for a model (called at generation start).
    pub async fn mark_model_accessed(&self, model_id: &str) {
        let mut state = self.state.lock().await;
        state.registry.update_access(model_id);
        debug!("🔄 Updated LRU for {}", model_id);
    }

    /// Mark a model unloaded, optionally recording a crash. Crash recording
    /// happens even when the model was never tracked, so repeated connection
    /// failures on untracked externals still arm the breaker.
    pub async fn mark_model_unloaded(
        &self,
        model_id: &str,
        crashed: bool,
        crash_reason: Option<&str>,
    ) {
        {
            let mut state = self.state.lock().await;
            if let Some(model) = state.registry.get(model_id).cloned() {
                if model.is_external {
                    warn!(
                        "⏭️  {} is external (backend={}), unregistering without driving its lifecycle",
                        model_id, model.backend
                    );
                    state.registry.unregister(model_id);
                } else {
                    if let Err(e) = self.backends.unload(model_id, model.backend).await {
                        warn!("backend unload of {} failed: {}", model_id, e);
                    }
                    state.registry.unregister(model_id);
                }
                info!("✅ Marked {} as unloaded (crashed={})", model_id, crashed);
            } else {
                warn!(
                    "⚠️  Model {} not tracked as loaded (recording crash anyway)",
                    model_id
                );
            }
        }

        if crashed && self.circuit_breaker_enabled {
            self.crash_tracker
                .record_crash(model_id, crash_reason.unwrap_or("generation_failure"));
        }
    }

    pub async fn is_loaded(&self, model_id: &str) -> bool {
        self.state.lock().await.registry.is_loaded(model_id)
    }

    /// Snapshot of loaded models for the admin surface.
    pub async fn loaded_models(&self) -> Vec<LoadedModelStatus> {
        let state = self.state.lock().await;
        let mut models: Vec<LoadedModelStatus> = state
            .registry
            .all()
            .values()
            .map(|m| LoadedModelStatus {
                model_id: m.model_id.clone(),
                backend: m.backend.to_string(),
                size_gb: m.size_gb,
                priority: m.priority.as_str().to_string(),
                is_external: m.is_external,
                loaded_at: m.loaded_at.to_rfc3339(),
                last_accessed: m.last_accessed.to_rfc3339(),
            })
            .collect();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        models
    }

    /// Full status snapshot including memory readings and crash statistics.
    pub async fn get_status(&self) -> Result<StatusSnapshot, GatewayError> {
        let mut mem = self.memory.status().await.unwrap_or_default();
        let loaded_models = self.loaded_models().await;

        let state = self.state.lock().await;
        let total_model = state.registry.total_usage_gb();
        let manageable = state.registry.manageable_usage_gb();
        mem.model_usage_gb = total_model;
        let usage_pct = if state.hard_limit_gb > 0.0 {
            manageable / state.hard_limit_gb * 100.0
        } else {
            0.0
        };

        Ok(StatusSnapshot {
            memory: MemorySection {
                total_gb: mem.total_gb,
                used_gb: mem.used_gb,
                available_gb: mem.available_gb,
                total_model_vram_gb: total_model,
                manageable_vram_gb: manageable,
                soft_limit_gb: state.soft_limit_gb,
                hard_limit_gb: state.hard_limit_gb,
                usage_pct,
                psi_some_avg10: mem.pressure_some_avg10,
                psi_full_avg10: mem.pressure_full_avg10,
            },
            loaded_models,
            crash_tracker: if self.circuit_breaker_enabled {
                self.crash_tracker.all_stats()
            } else {
                Vec::new()
            },
        })
    }

    /// Manual buffer cache flush.
    pub async fn flush_buffer_cache(&self) -> Result<(), GatewayError> {
        self.memory.flush_cache().await
    }

    /// Cross-check the registry against backend reality. Entries present in
    /// the registry but gone from the backend (OOM-killed, manually stopped)
    /// are silently unregistered. Backend-side models we never tracked are
    /// left alone; the backend may be managing pre-loaded auxiliaries.
    pub async fn reconcile_registry(&self) -> Result<ReconcileStats, GatewayError> {
        let actually_loaded = match self.backends.list_loaded(BackendKind::Ollama).await? {
            Some(loaded) => loaded,
            None => {
                return Ok(ReconcileStats {
                    registry_count: 0,
                    backend_count: 0,
                    cleaned_count: 0,
                    cleaned_models: Vec::new(),
                })
            }
        };

        let mut state = self.state.lock().await;
        let tracked: Vec<String> = state
            .registry
            .by_backend(BackendKind::Ollama)
            .iter()
            .map(|m| m.model_id.clone())
            .collect();

        let mut cleaned = Vec::new();
        for model_id in &tracked {
            if !actually_loaded.contains(model_id) {
                warn!(
                    "⚠️  Registry desync: {} tracked but absent from backend, cleaning up",
                    model_id
                );
                state.registry.unregister(model_id);
                cleaned.push(model_id.clone());
            }
        }

        let stats = ReconcileStats {
            registry_count: tracked.len(),
            backend_count: actually_loaded.len(),
            cleaned_count: cleaned.len(),
            cleaned_models: cleaned,
        };

        if stats.cleaned_count > 0 {
            info!(
                "🔄 Registry reconciliation cleaned {} desynced models (registry: {}, actual: {})",
                stats.cleaned_count, stats.registry_count, stats.backend_count
            );
        } else {
            debug!(
                "✅ Registry in sync (registry: {}, actual: {})",
                stats.registry_count, stats.backend_count
            );
        }
        Ok(stats)
    }

    /// Emergency eviction under sustained memory pressure: evict exactly one
    /// model, the globally least recently used whose priority is at or below
    /// `max_priority`. CRITICAL and external models are never eligible.
    pub async fn emergency_evict_lru(&self, max_priority: ModelPriority) -> EvictionOutcome {
        let mut state = self.state.lock().await;

        let mut candidates: Vec<LoadedModel> = state
            .registry
            .all()
            .values()
            .filter(|m| {
                m.priority >= max_priority
                    && m.priority != ModelPriority::Critical
                    && !m.is_external
            })
            .cloned()
            .collect();

        if candidates.is_empty() {
            warn!(
                "⚠️  Emergency eviction requested (max_priority={}) but no eligible models",
                max_priority.as_str()
            );
            return EvictionOutcome {
                evicted: false,
                model_id: None,
                size_gb: 0.0,
                reason: "no_eligible_models".to_string(),
            };
        }

        candidates.sort_by_key(|m| m.last_accessed);
        let victim = candidates.remove(0);
        warn!(
            "🚨 Emergency PSI eviction: {} ({:.1}GB, {}, last_accessed={})",
            victim.model_id,
            victim.size_gb,
            victim.priority.as_str(),
            victim.last_accessed.to_rfc3339()
        );

        match self.backends.unload(&victim.model_id, victim.backend).await {
            Ok(()) => {
                state.registry.unregister(&victim.model_id);
                EvictionOutcome {
                    evicted: true,
                    model_id: Some(victim.model_id),
                    size_gb: victim.size_gb,
                    reason: "psi_emergency".to_string(),
                }
            }
            Err(e) => EvictionOutcome {
                evicted: false,
                model_id: Some(victim.model_id),
                size_gb: 0.0,
                reason: format!("eviction_failed: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{BackendSpec, ModelCapability, ThinkingFormat};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn capability(
        model_id: &str,
        size_gb: f64,
        priority: ModelPriority,
        is_external: bool,
        endpoint: &str,
    ) -> ModelCapability {
        ModelCapability {
            model_id: model_id.to_string(),
            backend: BackendSpec {
                kind: if is_external {
                    crate::capabilities::BackendKind::Sglang
                } else {
                    crate::capabilities::BackendKind::Ollama
                },
                endpoint: endpoint.to_string(),
            },
            vram_size_gb: size_gb,
            priority,
            supports_tools: false,
            supports_thinking: false,
            supports_vision: false,
            thinking_format: ThinkingFormat::Bool,
            default_thinking_level: "high".to_string(),
            keep_alive_seconds: 300,
            is_external,
        }
    }

    /// Backend stub that accepts unloads (`POST /api/generate` → 200).
    async fn unloadable_backend() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        server
    }

    fn orchestrator(models: Vec<ModelCapability>, hard_limit_gb: f64) -> VramOrchestrator {
        let capabilities = Arc::new(CapabilityRegistry::new(models));
        let backends = Arc::new(BackendManager::new(
            capabilities.clone(),
            Duration::from_millis(500),
        ));
        let (tracker, _rx) = CrashTracker::new(60, 3);
        VramOrchestrator::new(
            capabilities,
            Arc::new(FixedMemoryMonitor::with_available_gb(60.0)),
            backends,
            Arc::new(tracker),
            OrchestratorSettings {
                soft_limit_gb: hard_limit_gb - 10.0,
                hard_limit_gb,
                circuit_breaker_enabled: true,
                circuit_breaker_buffer_gb: 5.0,
            },
        )
    }

    const UNREACHABLE: &str = "http://127.0.0.1:9";

    #[tokio::test]
    async fn test_cache_hit_refreshes_lru_without_backend_calls() {
        let orch = orchestrator(
            vec![capability("m", 20.0, ModelPriority::Normal, false, UNREACHABLE)],
            100.0,
        );
        orch.request_model_load("m").await.unwrap();

        let before = {
            let state = orch.state.lock().await;
            state.registry.get("m").unwrap().last_accessed
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        orch.request_model_load("m").await.unwrap();

        let state = orch.state.lock().await;
        assert_eq!(state.registry.len(), 1);
        assert!(state.registry.get("m").unwrap().last_accessed > before);
    }

    #[tokio::test]
    async fn test_unknown_model_is_config_error() {
        let orch = orchestrator(vec![], 100.0);
        let err = orch.request_model_load("ghost").await.unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[tokio::test]
    async fn test_simple_admission_fills_budget() {
        let orch = orchestrator(
            vec![
                capability("a", 20.0, ModelPriority::Normal, false, UNREACHABLE),
                capability("b", 30.0, ModelPriority::Normal, false, UNREACHABLE),
            ],
            50.0,
        );

        orch.request_model_load("a").await.unwrap();
        orch.request_model_load("b").await.unwrap();

        let state = orch.state.lock().await;
        assert_eq!(state.registry.manageable_usage_gb(), 50.0);
    }

    #[tokio::test]
    async fn test_over_budget_evicts_oldest() {
        let server = unloadable_backend().await;
        let orch = orchestrator(
            vec![
                capability("a", 20.0, ModelPriority::Normal, false, &server.uri()),
                capability("b", 30.0, ModelPriority::Normal, false, &server.uri()),
                capability("c", 1.0, ModelPriority::Normal, false, &server.uri()),
            ],
            50.0,
        );

        orch.request_model_load("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        orch.request_model_load("b").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        orch.request_model_load("c").await.unwrap();

        let state = orch.state.lock().await;
        assert!(!state.registry.is_loaded("a"), "oldest model should be evicted");
        assert!(state.registry.is_loaded("b"));
        assert!(state.registry.is_loaded("c"));
        assert!(state.registry.manageable_usage_gb() <= 50.0);
    }

    #[tokio::test]
    async fn test_critical_survives_priority_eviction() {
        let server = unloadable_backend().await;
        let orch = orchestrator(
            vec![
                capability("critical", 40.0, ModelPriority::Critical, false, &server.uri()),
                capability("normal", 30.0, ModelPriority::Normal, false, &server.uri()),
                capability("low", 25.0, ModelPriority::Low, false, &server.uri()),
                capability("incoming", 30.0, ModelPriority::Normal, false, &server.uri()),
            ],
            100.0,
        );

        orch.request_model_load("normal").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        orch.request_model_load("low").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        orch.request_model_load("critical").await.unwrap();

        // 95GB used; +30 requires 25GB freed. LOW goes first despite being
        // newer than NORMAL.
        orch.request_model_load("incoming").await.unwrap();

        let state = orch.state.lock().await;
        assert!(state.registry.is_loaded("critical"));
        assert!(!state.registry.is_loaded("low"));
        assert!(state.registry.is_loaded("normal"));
        assert!(state.registry.is_loaded("incoming"));
    }

    #[tokio::test]
    async fn test_memory_error_when_only_critical_loaded() {
        let orch = orchestrator(
            vec![
                capability("critical", 90.0, ModelPriority::Critical, false, UNREACHABLE),
                capability("incoming", 30.0, ModelPriority::Normal, false, UNREACHABLE),
            ],
            100.0,
        );

        orch.request_model_load("critical").await.unwrap();
        let err = orch.request_model_load("incoming").await.unwrap_err();
        assert!(matches!(err, GatewayError::Memory(_)));
    }

    #[tokio::test]
    async fn test_failed_eviction_keeps_entry_and_fails_load() {
        // Backend refuses connections: the victim cannot actually be
        // unloaded, so the load must fail and the victim stays tracked.
        let orch = orchestrator(
            vec![
                capability("old", 40.0, ModelPriority::Normal, false, UNREACHABLE),
                capability("incoming", 20.0, ModelPriority::Normal, false, UNREACHABLE),
            ],
            50.0,
        );

        orch.request_model_load("old").await.unwrap();
        let err = orch.request_model_load("incoming").await.unwrap_err();
        assert!(matches!(err, GatewayError::Memory(_)));
        assert!(orch.is_loaded("old").await);
        assert!(!orch.is_loaded("incoming").await);
    }

    #[tokio::test]
    async fn test_double_unload_is_noop() {
        let server = unloadable_backend().await;
        let orch = orchestrator(
            vec![capability("m", 20.0, ModelPriority::Normal, false, &server.uri())],
            100.0,
        );
        orch.request_model_load("m").await.unwrap();

        orch.mark_model_unloaded("m", false, None).await;
        assert!(!orch.is_loaded("m").await);
        // Second call must not panic or re-register anything.
        orch.mark_model_unloaded("m", false, None).await;
        assert!(!orch.is_loaded("m").await);
    }

    #[tokio::test]
    async fn test_crash_recorded_for_untracked_model() {
        let orch = orchestrator(
            vec![capability("m", 20.0, ModelPriority::Normal, false, UNREACHABLE)],
            100.0,
        );
        orch.mark_model_unloaded("m", true, Some("connection_error"))
            .await;
        assert_eq!(orch.crash_tracker().crash_count("m"), 1);
    }

    #[tokio::test]
    async fn test_external_model_unregistered_without_unload() {
        // Unreachable endpoint proves no lifecycle call is attempted.
        let orch = orchestrator(
            vec![capability("ext", 80.0, ModelPriority::High, true, UNREACHABLE)],
            200.0,
        );
        orch.request_model_load("ext").await.unwrap();
        assert!(orch.is_loaded("ext").await);

        orch.mark_model_unloaded("ext", false, None).await;
        assert!(!orch.is_loaded("ext").await);
    }

    #[tokio::test]
    async fn test_emergency_evict_respects_priority_cap() {
        let server = unloadable_backend().await;
        let orch = orchestrator(
            vec![
                capability("high", 35.0, ModelPriority::High, false, &server.uri()),
                capability("low", 20.0, ModelPriority::Low, false, &server.uri()),
            ],
            100.0,
        );
        orch.request_model_load("high").await.unwrap();
        orch.request_model_load("low").await.unwrap();

        let outcome = orch.emergency_evict_lru(ModelPriority::Low).await;
        assert!(outcome.evicted);
        assert_eq!(outcome.model_id.as_deref(), Some("low"));
        assert_eq!(outcome.size_gb, 20.0);
        assert_eq!(outcome.reason, "psi_emergency");
        assert!(orch.is_loaded("high").await);
    }

    #[tokio::test]
    async fn test_emergency_evict_no_eligible_models() {
        let orch = orchestrator(
            vec![capability("critical", 40.0, ModelPriority::Critical, false, UNREACHABLE)],
            100.0,
        );
        orch.request_model_load("critical").await.unwrap();

        let outcome = orch.emergency_evict_lru(ModelPriority::High).await;
        assert!(!outcome.evicted);
        assert!(outcome.model_id.is_none());
        assert_eq!(outcome.reason, "no_eligible_models");
        assert!(orch.is_loaded("critical").await);
    }

    #[tokio::test]
    async fn test_emergency_evict_backend_failure_keeps_model() {
        let orch = orchestrator(
            vec![capability("low", 20.0, ModelPriority::Low, false, UNREACHABLE)],
            100.0,
        );
        orch.request_model_load("low").await.unwrap();

        let outcome = orch.emergency_evict_lru(ModelPriority::Low).await;
        assert!(!outcome.evicted);
        assert_eq!(outcome.model_id.as_deref(), Some("low"));
        assert!(outcome.reason.starts_with("eviction_failed"));
        assert!(orch.is_loaded("low").await);
    }

    #[tokio::test]
    async fn test_status_reports_manageable_usage_pct() {
        let orch = orchestrator(
            vec![
                capability("a", 20.0, ModelPriority::Normal, false, UNREACHABLE),
                capability("ext", 80.0, ModelPriority::High, true, UNREACHABLE),
            ],
            100.0,
        );
        orch.request_model_load("a").await.unwrap();
        orch.request_model_load("ext").await.unwrap();

        let status = orch.get_status().await.unwrap();
        assert_eq!(status.memory.manageable_vram_gb, 20.0);
        assert_eq!(status.memory.total_model_vram_gb, 100.0);
        assert!((status.memory.usage_pct - 20.0).abs() < f64::EPSILON);
        assert_eq!(status.loaded_models.len(), 2);
    }

    #[tokio::test]
    async fn test_zero_size_load_at_exact_limit() {
        let orch = orchestrator(
            vec![
                capability("full", 100.0, ModelPriority::Normal, false, UNREACHABLE),
                capability("zero", 0.0, ModelPriority::Normal, false, UNREACHABLE),
            ],
            100.0,
        );
        orch.request_model_load("full").await.unwrap();
        // Exactly at the hard limit: a zero-size load succeeds with no eviction.
        orch.request_model_load("zero").await.unwrap();
        assert!(orch.is_loaded("full").await);
        assert!(orch.is_loaded("zero").await);
    }
}

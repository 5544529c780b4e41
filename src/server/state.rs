//! # Application State
//!
//! The process-root object graph: every long-lived singleton (capability
//! registry, VRAM orchestrator, profile manager, queue, fan-out, request
//! orchestrator) is constructed once here and passed explicitly; there are
//! no ambient lookups.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::agent::{AgentRunner, HttpWebTool, WebTool};
use crate::backends::BackendManager;
use crate::capabilities::CapabilityRegistry;
use crate::config::{Config, ModelsDocument};
use crate::error::GatewayError;
use crate::metrics::MetricsCollector;
use crate::orchestrator::RequestOrchestrator;
use crate::preferences::PreferenceResolver;
use crate::profiles::ProfileManager;
use crate::queue::RequestQueue;
use crate::router::RouterService;
use crate::storage::{
    ArtifactExtractor, ConversationStore, MemoryConversationStore, MemoryUserStore,
    NoopArtifactExtractor, UserStore,
};
use crate::vram::{
    CrashAlert, CrashTracker, MemoryMonitor, OrchestratorSettings, SystemMemoryMonitor,
    VramOrchestrator,
};
use crate::ws::WsFanout;

/// External collaborators injectable at construction; defaults suit a
/// single-node deployment.
pub struct Collaborators {
    pub conversations: Arc<dyn ConversationStore>,
    pub users: Arc<dyn UserStore>,
    pub extractor: Arc<dyn ArtifactExtractor>,
    pub web: Arc<dyn WebTool>,
    pub memory: Arc<dyn MemoryMonitor>,
}

impl Collaborators {
    pub fn defaults(config: &Config) -> Self {
        Self {
            conversations: Arc::new(MemoryConversationStore::new()),
            users: Arc::new(MemoryUserStore::new()),
            extractor: Arc::new(NoopArtifactExtractor),
            web: Arc::new(HttpWebTool::new(
                None,
                Duration::from_secs(config.fetch_timeout_seconds),
            )),
            memory: Arc::new(SystemMemoryMonitor::new()),
        }
    }
}

/// Shared state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub profiles: Arc<ProfileManager>,
    pub vram: Arc<VramOrchestrator>,
    pub backends: Arc<BackendManager>,
    pub queue: Arc<RequestQueue>,
    pub fanout: Arc<WsFanout>,
    pub orchestrator: Arc<RequestOrchestrator>,
    pub conversations: Arc<dyn ConversationStore>,
    pub users: Arc<dyn UserStore>,
    pub metrics: Arc<MetricsCollector>,
}

impl AppState {
    /// Build the full object graph from configuration. Returns the state
    /// plus the crash-alert receiver the breaker supervisor consumes.
    pub fn new(
        config: Config,
        document: ModelsDocument,
        collaborators: Collaborators,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CrashAlert>), GatewayError> {
        let (capabilities, profiles_map) = document.into_parts();
        let capabilities = Arc::new(capabilities);

        let backends = Arc::new(BackendManager::new(
            capabilities.clone(),
            Duration::from_secs(config.http_client_timeout),
        ));

        let (crash_tracker, alerts) = CrashTracker::new(
            config.vram_crash_window_seconds,
            config.vram_crash_threshold,
        );
        let crash_tracker = Arc::new(crash_tracker);

        let startup_profile = profiles_map.get(&config.active_profile).ok_or_else(|| {
            GatewayError::Config(format!("unknown startup profile {}", config.active_profile))
        })?;

        let vram = Arc::new(VramOrchestrator::new(
            capabilities.clone(),
            collaborators.memory.clone(),
            backends.clone(),
            crash_tracker,
            OrchestratorSettings {
                soft_limit_gb: startup_profile.soft_limit_gb,
                hard_limit_gb: startup_profile.hard_limit_gb,
                circuit_breaker_enabled: config.vram_circuit_breaker_enabled,
                circuit_breaker_buffer_gb: config.vram_circuit_breaker_buffer_gb,
            },
        ));

        let profiles = Arc::new(ProfileManager::new(
            profiles_map,
            &config.active_profile,
            vram.clone(),
        )?);

        let router = Arc::new(RouterService::new(backends.clone(), profiles.clone()));
        let resolver = PreferenceResolver::new(capabilities.clone(), config.default_temperature);
        let agent = Arc::new(AgentRunner::new(
            backends.clone(),
            capabilities.clone(),
            profiles.clone(),
            vram.clone(),
            collaborators.web,
        ));

        let orchestrator = Arc::new(RequestOrchestrator::new(
            collaborators.conversations.clone(),
            collaborators.users.clone(),
            agent,
            router,
            resolver,
            profiles.clone(),
            collaborators.extractor,
            config.disable_token_budget,
            config.default_token_budget,
        ));

        let state = Self {
            queue: Arc::new(RequestQueue::new(config.max_queue_size, config.max_retries)),
            fanout: Arc::new(WsFanout::new()),
            config: Arc::new(config),
            capabilities,
            profiles,
            vram,
            backends,
            orchestrator,
            conversations: collaborators.conversations,
            users: collaborators.users,
            metrics: Arc::new(MetricsCollector::new()),
        };
        Ok((state, alerts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE_DOCUMENT;

    #[tokio::test]
    async fn test_state_construction_from_sample_document() {
        let mut config = Config::for_test();
        config.active_profile = "performance".to_string();
        let document = ModelsDocument::from_toml(SAMPLE_DOCUMENT).unwrap();
        let collaborators = Collaborators::defaults(&config);

        let (state, _alerts) = AppState::new(config, document, collaborators).unwrap();
        assert_eq!(state.capabilities.len(), 4);
        assert_eq!(
            state.profiles.get_active_profile().await.profile_name,
            "performance"
        );
        assert_eq!(state.queue.size(), 0);
    }

    #[tokio::test]
    async fn test_unknown_startup_profile_rejected() {
        let mut config = Config::for_test();
        config.active_profile = "ghost".to_string();
        let document = ModelsDocument::from_toml(SAMPLE_DOCUMENT).unwrap();
        let collaborators = Collaborators::defaults(&config);

        assert!(AppState::new(config, document, collaborators).is_err());
    }
}

//! # Profile Manager
//!
//! A profile bundles the VRAM limits, the role→model map, and per-route
//! fetch budgets; exactly one profile is active at a time. The manager holds
//! the active profile behind its own mutex, reacts to circuit-breaker alerts
//! by switching to a conservative fallback, and offers a recovery path back
//! once the tripped model's crash window drains.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::router::RouteKind;
use crate::vram::{CrashAlert, VramOrchestrator};

/// Role → model assignments for one profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleMap {
    pub router: String,
    pub coder: String,
    pub reasoning: String,
    pub research: String,
    pub math: String,
    #[serde(default)]
    pub artifact_extraction: Option<String>,
}

impl RoleMap {
    /// All role assignments, for validation and introspection.
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        let mut entries = vec![
            ("router", self.router.as_str()),
            ("coder", self.coder.as_str()),
            ("reasoning", self.reasoning.as_str()),
            ("research", self.research.as_str()),
            ("math", self.math.as_str()),
        ];
        if let Some(extraction) = &self.artifact_extraction {
            entries.push(("artifact_extraction", extraction.as_str()));
        }
        entries
    }

    pub fn contains_model(&self, model_id: &str) -> bool {
        self.entries().iter().any(|(_, m)| *m == model_id)
    }
}

/// A named bundle of VRAM limits and role mappings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    #[serde(skip)]
    pub profile_name: String,
    pub soft_limit_gb: f64,
    pub hard_limit_gb: f64,
    pub roles: RoleMap,
    #[serde(default)]
    pub fetch_limits: HashMap<String, i64>,
    #[serde(default)]
    pub artifact_extraction_model: Option<String>,
    #[serde(default)]
    pub fallback_profile: Option<String>,
    #[serde(default)]
    pub conservative_mode: bool,
}

impl Profile {
    /// Execution model for a classified route.
    pub fn model_for_route(&self, route: RouteKind) -> &str {
        match route {
            RouteKind::SelfHandle => &self.roles.router,
            RouteKind::SimpleCode => &self.roles.coder,
            RouteKind::Reasoning => &self.roles.reasoning,
            RouteKind::Research => &self.roles.research,
            RouteKind::Math => &self.roles.math,
        }
    }

    /// Web-fetch budget for a route; `-1` means unlimited.
    pub fn fetch_limit_for_route(&self, route: RouteKind) -> i64 {
        self.fetch_limits
            .get(route.as_str_lower())
            .or_else(|| self.fetch_limits.get("default"))
            .copied()
            .unwrap_or(5)
    }

    /// Artifact extraction model: explicit setting, then the role map.
    pub fn extraction_model(&self) -> Option<&str> {
        self.artifact_extraction_model
            .as_deref()
            .or(self.roles.artifact_extraction.as_deref())
    }
}

#[derive(Debug, Clone)]
struct FallbackState {
    from_profile: String,
    tripped_model: String,
}

struct ManagerState {
    active: Profile,
    fallback: Option<FallbackState>,
}

/// Owner of the active profile reference. Readers obtain cloned snapshots;
/// mutation is serialized through the internal mutex.
pub struct ProfileManager {
    profiles: HashMap<String, Profile>,
    state: Mutex<ManagerState>,
    orchestrator: Arc<VramOrchestrator>,
}

impl ProfileManager {
    pub fn new(
        profiles: HashMap<String, Profile>,
        initial: &str,
        orchestrator: Arc<VramOrchestrator>,
    ) -> Result<Self, GatewayError> {
        let active = profiles
            .get(initial)
            .cloned()
            .ok_or_else(|| GatewayError::Config(format!("unknown startup profile {}", initial)))?;
        Ok(Self {
            profiles,
            state: Mutex::new(ManagerState {
                active,
                fallback: None,
            }),
            orchestrator,
        })
    }

    /// Stable snapshot of the active profile.
    pub async fn get_active_profile(&self) -> Profile {
        self.state.lock().await.active.clone()
    }

    pub async fn is_in_fallback(&self) -> bool {
        self.state.lock().await.fallback.is_some()
    }

    pub fn known_profiles(&self) -> Vec<String> {
        let mut names: Vec<_> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    /// Switch the active profile and push the new limits into the
    /// orchestrator. Clears any fallback bookkeeping: an explicit switch is
    /// an operator decision, not a breaker response.
    pub async fn switch_profile(&self, name: &str, reason: &str) -> Result<(), GatewayError> {
        let profile = self
            .profiles
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::Config(format!("unknown profile {}", name)))?;

        {
            let mut state = self.state.lock().await;
            info!(
                "🔀 Switching profile {} → {} ({})",
                state.active.profile_name, name, reason
            );
            state.active = profile.clone();
            state.fallback = None;
        }
        self.orchestrator
            .update_limits(profile.soft_limit_gb, profile.hard_limit_gb)
            .await;
        Ok(())
    }

    /// Breaker-initiated switch into the active profile's fallback. Records
    /// what tripped so recovery can be checked later. No-op when already in
    /// fallback or when the active profile declares none.
    pub async fn enter_fallback(&self, tripped_model: &str, reason: &str) {
        let fallback_profile = {
            let mut state = self.state.lock().await;
            if state.fallback.is_some() {
                return;
            }
            let Some(fallback_name) = state.active.fallback_profile.clone() else {
                warn!(
                    "⚠️  Circuit breaker tripped by {} but profile {} has no fallback",
                    tripped_model, state.active.profile_name
                );
                return;
            };
            let Some(fallback) = self.profiles.get(&fallback_name).cloned() else {
                warn!("⚠️  Fallback profile {} missing", fallback_name);
                return;
            };

            warn!(
                "🛟 Circuit breaker fallback: {} → {} (tripped by {}, {})",
                state.active.profile_name, fallback_name, tripped_model, reason
            );
            state.fallback = Some(FallbackState {
                from_profile: state.active.profile_name.clone(),
                tripped_model: tripped_model.to_string(),
            });
            state.active = fallback.clone();
            fallback
        };

        self.orchestrator
            .update_limits(fallback_profile.soft_limit_gb, fallback_profile.hard_limit_gb)
            .await;
    }

    /// Cheap health probe called at the start of each request: once the
    /// tripped model's crash window has fully drained, return to the profile
    /// we fell back from.
    pub async fn check_and_recover(&self) {
        let recover_to = {
            let state = self.state.lock().await;
            match &state.fallback {
                Some(fallback)
                    if self
                        .orchestrator
                        .crash_tracker()
                        .crash_count(&fallback.tripped_model)
                        == 0 =>
                {
                    Some((fallback.from_profile.clone(), fallback.tripped_model.clone()))
                }
                _ => None,
            }
        };

        if let Some((from_profile, tripped_model)) = recover_to {
            info!(
                "💚 Crash window drained for {}, recovering to profile {}",
                tripped_model, from_profile
            );
            if let Err(e) = self
                .switch_profile(&from_profile, "circuit breaker recovery")
                .await
            {
                warn!("recovery switch failed: {}", e);
            }
        }
    }

    /// Supervisor task consuming crash alerts. Alerts for models outside the
    /// active role map are ignored; everything else triggers the fallback.
    pub fn spawn_breaker_supervisor(
        self: Arc<Self>,
        mut alerts: mpsc::UnboundedReceiver<CrashAlert>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(alert) = alerts.recv().await {
                let active = self.get_active_profile().await;
                if !active.roles.contains_model(&alert.model_id) {
                    warn!(
                        "⚠️  Ignoring crash alert for {} (not in active role map)",
                        alert.model_id
                    );
                    continue;
                }
                self.enter_fallback(
                    &alert.model_id,
                    &format!("{} crashes: {}", alert.crash_count, alert.reason),
                )
                .await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendManager;
    use crate::capabilities::CapabilityRegistry;
    use crate::vram::{CrashTracker, FixedMemoryMonitor, OrchestratorSettings};
    use std::time::Duration;

    fn profile(name: &str, soft: f64, hard: f64, fallback: Option<&str>) -> Profile {
        Profile {
            profile_name: name.to_string(),
            soft_limit_gb: soft,
            hard_limit_gb: hard,
            roles: RoleMap {
                router: "router:20b".into(),
                coder: "coder:7b".into(),
                reasoning: "reasoner:24b".into(),
                research: "reasoner:24b".into(),
                math: "coder:7b".into(),
                artifact_extraction: None,
            },
            fetch_limits: HashMap::from([("default".to_string(), 5), ("reasoning".to_string(), 3)]),
            artifact_extraction_model: None,
            fallback_profile: fallback.map(str::to_string),
            conservative_mode: false,
        }
    }

    fn manager(window_seconds: u64) -> (Arc<ProfileManager>, Arc<VramOrchestrator>) {
        let capabilities = Arc::new(CapabilityRegistry::default());
        let backends = Arc::new(BackendManager::new(
            capabilities.clone(),
            Duration::from_millis(200),
        ));
        let (tracker, _rx) = CrashTracker::new(window_seconds, 3);
        let orchestrator = Arc::new(VramOrchestrator::new(
            capabilities,
            Arc::new(FixedMemoryMonitor::with_available_gb(60.0)),
            backends,
            Arc::new(tracker),
            OrchestratorSettings {
                soft_limit_gb: 100.0,
                hard_limit_gb: 110.0,
                circuit_breaker_enabled: true,
                circuit_breaker_buffer_gb: 5.0,
            },
        ));

        let profiles = HashMap::from([
            ("performance".to_string(), profile("performance", 100.0, 110.0, Some("conservative"))),
            ("conservative".to_string(), profile("conservative", 12.0, 16.0, None)),
        ]);
        let manager =
            Arc::new(ProfileManager::new(profiles, "performance", orchestrator.clone()).unwrap());
        (manager, orchestrator)
    }

    #[test]
    fn test_route_to_model_mapping() {
        let p = profile("p", 100.0, 110.0, None);
        assert_eq!(p.model_for_route(RouteKind::SelfHandle), "router:20b");
        assert_eq!(p.model_for_route(RouteKind::SimpleCode), "coder:7b");
        assert_eq!(p.model_for_route(RouteKind::Reasoning), "reasoner:24b");
    }

    #[test]
    fn test_fetch_limit_falls_back_to_default() {
        let p = profile("p", 100.0, 110.0, None);
        assert_eq!(p.fetch_limit_for_route(RouteKind::Reasoning), 3);
        assert_eq!(p.fetch_limit_for_route(RouteKind::Research), 5);
    }

    #[tokio::test]
    async fn test_unknown_startup_profile_rejected() {
        let (_, orchestrator) = manager(60);
        let err = ProfileManager::new(HashMap::new(), "ghost", orchestrator).err();
        assert!(matches!(err, Some(GatewayError::Config(_))));
    }

    #[tokio::test]
    async fn test_enter_fallback_switches_and_records() {
        let (manager, _) = manager(60);
        assert!(!manager.is_in_fallback().await);

        manager.enter_fallback("reasoner:24b", "3 crashes").await;
        assert!(manager.is_in_fallback().await);
        assert_eq!(
            manager.get_active_profile().await.profile_name,
            "conservative"
        );

        // Re-entering is a no-op.
        manager.enter_fallback("coder:7b", "more crashes").await;
        assert_eq!(
            manager.get_active_profile().await.profile_name,
            "conservative"
        );
    }

    #[tokio::test]
    async fn test_recovery_when_crash_window_drains() {
        // Zero-second window: crashes age out immediately, so recovery is
        // possible on the next check.
        let (manager, orchestrator) = manager(0);
        orchestrator.crash_tracker().record_crash("reasoner:24b", "x");
        manager.enter_fallback("reasoner:24b", "crashes").await;
        assert!(manager.is_in_fallback().await);

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.check_and_recover().await;

        assert!(!manager.is_in_fallback().await);
        assert_eq!(
            manager.get_active_profile().await.profile_name,
            "performance"
        );
    }

    #[tokio::test]
    async fn test_supervisor_ignores_models_outside_role_map() {
        let (manager, _) = manager(60);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = manager.clone().spawn_breaker_supervisor(rx);

        tx.send(CrashAlert {
            model_id: "unrelated:3b".into(),
            crash_count: 5,
            reason: "connection_error".into(),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!manager.is_in_fallback().await);

        tx.send(CrashAlert {
            model_id: "reasoner:24b".into(),
            crash_count: 3,
            reason: "connection_error".into(),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(manager.is_in_fallback().await);

        drop(tx);
        let _ = handle.await;
    }
}

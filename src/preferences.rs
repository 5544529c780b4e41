//! # Preference Resolver
//!
//! Merges per-request overrides, stored user preferences, and the active
//! profile's defaults into one resolved plan. Precedence for model choice:
//! explicit request override > user-stored preference > profile default.
//! An explicit choice bypasses route classification (artifact detection
//! still runs).

use crate::capabilities::CapabilityRegistry;
use crate::profiles::Profile;
use crate::queue::QueuedRequest;
use crate::storage::UserPreferences;
use std::sync::Arc;
use tracing::warn;

/// Where the resolved model choice came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSource {
    Profile,
    User,
    Request,
}

impl ModelSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::User => "user",
            Self::Request => "request",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPreferences {
    /// Explicit model when routing is bypassed; `None` leaves the choice to
    /// the router and role map.
    pub model: Option<String>,
    pub model_source: ModelSource,
    pub temperature: f32,
    /// None = auto (route decides), Some(true/false) = user forced.
    pub thinking_enabled: Option<bool>,
    pub artifact_extraction_model: Option<String>,
    pub artifact_detection_model: String,
    pub should_bypass_routing: bool,
}

pub struct PreferenceResolver {
    capabilities: Arc<CapabilityRegistry>,
    default_temperature: f32,
}

impl PreferenceResolver {
    pub fn new(capabilities: Arc<CapabilityRegistry>, default_temperature: f32) -> Self {
        Self {
            capabilities,
            default_temperature,
        }
    }

    pub fn resolve(
        &self,
        request: &QueuedRequest,
        user_prefs: &UserPreferences,
        profile: &Profile,
    ) -> ResolvedPreferences {
        // Explicit choices only survive while they still name a known model;
        // a stale preference (or one dropped in a fallback profile reload)
        // silently reverts to the profile default.
        let (model, model_source) = match (&request.model_override, &user_prefs.preferred_model) {
            (Some(requested), _) if self.valid_model(requested) => {
                (Some(requested.clone()), ModelSource::Request)
            }
            (_, Some(preferred)) if self.valid_model(preferred) => {
                (Some(preferred.clone()), ModelSource::User)
            }
            (requested, preferred) => {
                if let Some(requested) = requested {
                    warn!("⚠️  Ignoring unknown request model override {}", requested);
                }
                if let Some(preferred) = preferred {
                    if !self.valid_model(preferred) {
                        warn!("⚠️  Ignoring unknown stored model preference {}", preferred);
                    }
                }
                (None, ModelSource::Profile)
            }
        };

        let should_bypass_routing = model.is_some();
        ResolvedPreferences {
            model,
            model_source,
            temperature: user_prefs.temperature.unwrap_or(self.default_temperature),
            thinking_enabled: user_prefs.thinking_enabled,
            artifact_extraction_model: profile.extraction_model().map(str::to_string),
            artifact_detection_model: profile.roles.router.clone(),
            should_bypass_routing,
        }
    }

    fn valid_model(&self, model_id: &str) -> bool {
        self.capabilities.contains(model_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{BackendKind, BackendSpec, ModelCapability, ModelPriority, ThinkingFormat};
    use crate::profiles::RoleMap;
    use std::collections::HashMap;

    fn capability(model_id: &str) -> ModelCapability {
        ModelCapability {
            model_id: model_id.to_string(),
            backend: BackendSpec {
                kind: BackendKind::Ollama,
                endpoint: "http://127.0.0.1:11434".to_string(),
            },
            vram_size_gb: 10.0,
            priority: ModelPriority::Normal,
            supports_tools: true,
            supports_thinking: false,
            supports_vision: false,
            thinking_format: ThinkingFormat::Bool,
            default_thinking_level: "high".to_string(),
            keep_alive_seconds: 300,
            is_external: false,
        }
    }

    fn resolver() -> PreferenceResolver {
        PreferenceResolver::new(
            Arc::new(CapabilityRegistry::new(vec![
                capability("router:20b"),
                capability("coder:7b"),
                capability("favorite:13b"),
            ])),
            0.7,
        )
    }

    fn profile() -> Profile {
        Profile {
            profile_name: "p".into(),
            soft_limit_gb: 100.0,
            hard_limit_gb: 110.0,
            roles: RoleMap {
                router: "router:20b".into(),
                coder: "coder:7b".into(),
                reasoning: "coder:7b".into(),
                research: "coder:7b".into(),
                math: "coder:7b".into(),
                artifact_extraction: Some("coder:7b".into()),
            },
            fetch_limits: HashMap::new(),
            artifact_extraction_model: None,
            fallback_profile: None,
            conservative_mode: false,
        }
    }

    #[test]
    fn test_profile_default_when_nothing_chosen() {
        let prefs = UserPreferences::default();
        let request = QueuedRequest::test_request("u", "hi");
        let resolved = resolver().resolve(&request, &prefs, &profile());

        assert!(resolved.model.is_none());
        assert_eq!(resolved.model_source, ModelSource::Profile);
        assert!(!resolved.should_bypass_routing);
        assert_eq!(resolved.temperature, 0.7);
        assert_eq!(resolved.artifact_detection_model, "router:20b");
        assert_eq!(resolved.artifact_extraction_model.as_deref(), Some("coder:7b"));
    }

    #[test]
    fn test_request_override_beats_user_preference() {
        let prefs = UserPreferences {
            preferred_model: Some("favorite:13b".into()),
            ..Default::default()
        };
        let mut request = QueuedRequest::test_request("u", "hi");
        request.model_override = Some("coder:7b".into());

        let resolved = resolver().resolve(&request, &prefs, &profile());
        assert_eq!(resolved.model.as_deref(), Some("coder:7b"));
        assert_eq!(resolved.model_source, ModelSource::Request);
        assert!(resolved.should_bypass_routing);
    }

    #[test]
    fn test_user_preference_used_when_no_override() {
        let prefs = UserPreferences {
            preferred_model: Some("favorite:13b".into()),
            temperature: Some(0.2),
            thinking_enabled: Some(true),
            ..Default::default()
        };
        let request = QueuedRequest::test_request("u", "hi");

        let resolved = resolver().resolve(&request, &prefs, &profile());
        assert_eq!(resolved.model.as_deref(), Some("favorite:13b"));
        assert_eq!(resolved.model_source, ModelSource::User);
        assert_eq!(resolved.temperature, 0.2);
        assert_eq!(resolved.thinking_enabled, Some(true));
    }

    #[test]
    fn test_unknown_choices_fall_back_to_profile() {
        let prefs = UserPreferences {
            preferred_model: Some("removed:1b".into()),
            ..Default::default()
        };
        let mut request = QueuedRequest::test_request("u", "hi");
        request.model_override = Some("ghost:2b".into());

        let resolved = resolver().resolve(&request, &prefs, &profile());
        assert!(resolved.model.is_none());
        assert_eq!(resolved.model_source, ModelSource::Profile);
        assert!(!resolved.should_bypass_routing);
    }

    #[test]
    fn test_bypass_implies_user_or_request_source() {
        let prefs = UserPreferences {
            preferred_model: Some("favorite:13b".into()),
            ..Default::default()
        };
        let request = QueuedRequest::test_request("u", "hi");
        let resolved = resolver().resolve(&request, &prefs, &profile());

        assert!(resolved.should_bypass_routing);
        assert!(matches!(
            resolved.model_source,
            ModelSource::User | ModelSource::Request
        ));
    }
}

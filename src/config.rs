//! # Configuration
//!
//! Two layers of configuration, loaded once at startup:
//!
//! - Runtime settings and feature flags come from command-line arguments with
//!   environment-variable fallbacks (plus `.env` support in the binary).
//! - The *models document* (TOML) declares the model capability registry and
//!   the VRAM profiles, and is validated before anything is constructed.

use clap::Parser;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::capabilities::{CapabilityRegistry, ModelCapability};
use crate::profiles::Profile;

/// Models document loading/validation errors.
#[derive(Debug, Error)]
pub enum ModelsDocumentError {
    #[error("failed to read models document: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse models document: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid models document: {0}")]
    Invalid(String),
}

/// # ModelMux Configuration
///
/// Runtime configuration for the serving backbone: server binding, queue and
/// retry policy, VRAM circuit breaker parameters, streaming cadence, and
/// operational feature flags.
#[derive(Debug, Clone, Parser)]
#[command(name = "modelmux")]
#[command(about = "LLM serving backbone with VRAM orchestration and streamed WebSocket chat delivery")]
#[command(version)]
pub struct Config {
    // =========================================================================
    // CORE SERVER CONFIGURATION
    // =========================================================================
    /// Server port to listen on
    #[arg(short, long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Server host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Path to the TOML models document (capabilities + profiles)
    #[arg(long, env = "MODELMUX_MODELS", default_value = "models.toml")]
    pub models_path: String,

    /// Profile to activate at startup (must exist in the models document)
    #[arg(long, env = "MODELMUX_PROFILE", default_value = "performance")]
    pub active_profile: String,

    /// API key required on /internal/* endpoints (unset = open)
    #[arg(long, env = "MODELMUX_INTERNAL_API_KEY")]
    pub internal_api_key: Option<String>,

    // =========================================================================
    // QUEUE AND RETRY POLICY
    // =========================================================================
    /// Maximum number of queued requests before admission fails fast
    #[arg(long, env = "MAX_QUEUE_SIZE", default_value = "50")]
    pub max_queue_size: usize,

    /// Maximum requeue count for a failed request
    #[arg(long, env = "MAX_RETRIES", default_value = "2")]
    pub max_retries: u32,

    /// Non-streaming retry attempts after an empty stream
    #[arg(long, env = "EMPTY_STREAM_RETRIES", default_value = "3")]
    pub empty_stream_retries: u32,

    // =========================================================================
    // VRAM ORCHESTRATION
    // =========================================================================
    /// Enable the crash-based circuit breaker
    #[arg(long, env = "VRAM_CIRCUIT_BREAKER_ENABLED", default_value = "true")]
    pub vram_circuit_breaker_enabled: bool,

    /// Crash window in seconds for the circuit breaker
    #[arg(long, env = "VRAM_CRASH_WINDOW_SECONDS", default_value = "60")]
    pub vram_crash_window_seconds: u64,

    /// Crash count within the window that arms the breaker
    #[arg(long, env = "VRAM_CRASH_THRESHOLD", default_value = "3")]
    pub vram_crash_threshold: usize,

    /// Extra headroom the breaker frees before a risky load, in GB
    #[arg(long, env = "VRAM_CIRCUIT_BREAKER_BUFFER_GB", default_value = "5.0")]
    pub vram_circuit_breaker_buffer_gb: f64,

    /// Conservative mode: aggressively unload after each request
    #[arg(long, env = "VRAM_CONSERVATIVE_MODE", default_value = "false")]
    pub vram_conservative_mode: bool,

    /// Seconds between registry/backend reconciliation passes (0 = disabled)
    #[arg(long, env = "VRAM_RECONCILE_INTERVAL_SECONDS", default_value = "60")]
    pub reconcile_interval_seconds: u64,

    /// Seconds between memory pressure samples (0 = disabled)
    #[arg(long, env = "VRAM_PRESSURE_INTERVAL_SECONDS", default_value = "30")]
    pub pressure_check_interval_seconds: u64,

    /// PSI some_avg10 percentage that triggers an emergency eviction
    #[arg(long, env = "VRAM_PRESSURE_SOME_THRESHOLD", default_value = "50.0")]
    pub pressure_some_threshold: f64,

    // =========================================================================
    // STREAMING
    // =========================================================================
    /// Enable streamed responses
    #[arg(long, env = "ENABLE_STREAMING", default_value = "true")]
    pub enable_streaming: bool,

    /// Minimum interval between stream chunks for chat clients, milliseconds
    #[arg(long, env = "STREAM_CHUNK_INTERVAL_MS", default_value = "800")]
    pub stream_chunk_interval_ms: u64,

    /// Minimum interval between stream chunks for web clients, milliseconds
    #[arg(long, env = "WEB_STREAM_CHUNK_INTERVAL_MS", default_value = "50")]
    pub web_stream_chunk_interval_ms: u64,

    // =========================================================================
    // TIMEOUTS
    // =========================================================================
    /// HTTP client timeout for buffered backend calls, seconds
    #[arg(long, env = "HTTP_CLIENT_TIMEOUT", default_value = "30")]
    pub http_client_timeout: u64,

    /// Base backend model-load timeout, seconds (scaled by model size)
    #[arg(long, env = "MODEL_LOAD_TIMEOUT_SECONDS", default_value = "300")]
    pub load_timeout_seconds: u64,

    /// Single web fetch timeout, seconds
    #[arg(long, env = "FETCH_TIMEOUT_SECONDS", default_value = "15")]
    pub fetch_timeout_seconds: u64,

    // =========================================================================
    // USERS AND BUDGETS
    // =========================================================================
    /// Disable per-user token budget enforcement
    #[arg(long, env = "DISABLE_TOKEN_BUDGET", default_value = "false")]
    pub disable_token_budget: bool,

    /// Token budget granted to newly created users
    #[arg(long, env = "DEFAULT_TOKEN_BUDGET", default_value = "500000")]
    pub default_token_budget: i64,

    /// Default sampling temperature when neither user nor request set one
    #[arg(long, env = "DEFAULT_TEMPERATURE", default_value = "0.7")]
    pub default_temperature: f32,

    // =========================================================================
    // MAINTENANCE
    // =========================================================================
    /// Soft maintenance: requests are accepted with a warning
    #[arg(long, env = "MAINTENANCE_MODE", default_value = "false")]
    pub maintenance_mode: bool,

    /// Warning shown to clients during soft maintenance
    #[arg(
        long,
        env = "MAINTENANCE_MESSAGE",
        default_value = "Maintenance in progress - responses may be slower than usual."
    )]
    pub maintenance_message: String,

    /// Hard maintenance: all new requests are rejected
    #[arg(long, env = "MAINTENANCE_MODE_HARD", default_value = "false")]
    pub maintenance_mode_hard: bool,

    /// Rejection message during hard maintenance
    #[arg(
        long,
        env = "MAINTENANCE_MESSAGE_HARD",
        default_value = "The service is down for maintenance. Please try again later."
    )]
    pub maintenance_message_hard: String,
}

impl Config {
    /// Parse configuration from CLI args and environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Fixed configuration for tests: defaults with budgets disabled.
    pub fn for_test() -> Self {
        let mut config = Self::parse_from(["modelmux"]);
        config.disable_token_budget = true;
        config
    }
}

/// The TOML models document: capability entries plus named profiles.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ModelsDocument {
    #[serde(default)]
    pub models: Vec<ModelCapability>,
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl ModelsDocument {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ModelsDocumentError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ModelsDocumentError> {
        let mut doc: ModelsDocument = toml::from_str(raw)?;
        for (name, profile) in doc.profiles.iter_mut() {
            profile.profile_name = name.clone();
        }
        doc.validate()?;
        Ok(doc)
    }

    /// Structural validation: limits are sane, every referenced model exists,
    /// fallback profiles exist and do not self-reference.
    fn validate(&self) -> Result<(), ModelsDocumentError> {
        let known: std::collections::HashSet<&str> =
            self.models.iter().map(|m| m.model_id.as_str()).collect();

        for (name, profile) in &self.profiles {
            if !(profile.soft_limit_gb > 0.0) || profile.hard_limit_gb < profile.soft_limit_gb {
                return Err(ModelsDocumentError::Invalid(format!(
                    "profile {}: requires hard_limit_gb >= soft_limit_gb > 0 (got soft={}, hard={})",
                    name, profile.soft_limit_gb, profile.hard_limit_gb
                )));
            }

            for (role, model_id) in profile.roles.entries() {
                if !known.contains(model_id) {
                    return Err(ModelsDocumentError::Invalid(format!(
                        "profile {}: role {} references unknown model {}",
                        name, role, model_id
                    )));
                }
            }

            if let Some(extraction) = &profile.artifact_extraction_model {
                if !known.contains(extraction.as_str()) {
                    return Err(ModelsDocumentError::Invalid(format!(
                        "profile {}: artifact_extraction_model {} not in registry",
                        name, extraction
                    )));
                }
            }

            if let Some(fallback) = &profile.fallback_profile {
                if fallback == name {
                    return Err(ModelsDocumentError::Invalid(format!(
                        "profile {} names itself as fallback",
                        name
                    )));
                }
                if !self.profiles.contains_key(fallback) {
                    return Err(ModelsDocumentError::Invalid(format!(
                        "profile {}: fallback profile {} does not exist",
                        name, fallback
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn into_parts(self) -> (CapabilityRegistry, HashMap<String, Profile>) {
        (CapabilityRegistry::new(self.models), self.profiles)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE_DOCUMENT: &str = r#"
        [[models]]
        model_id = "router:20b"
        vram_size_gb = 14.0
        priority = "CRITICAL"
        supports_tools = true
        supports_thinking = true
        thinking_format = "level"
        [models.backend]
        type = "ollama"
        endpoint = "http://127.0.0.1:11434"

        [[models]]
        model_id = "coder:7b"
        vram_size_gb = 6.0
        priority = "NORMAL"
        supports_tools = true
        [models.backend]
        type = "ollama"
        endpoint = "http://127.0.0.1:11434"

        [[models]]
        model_id = "reasoner:24b"
        vram_size_gb = 16.0
        priority = "HIGH"
        supports_tools = true
        supports_thinking = true
        [models.backend]
        type = "ollama"
        endpoint = "http://127.0.0.1:11434"

        [[models]]
        model_id = "giant:120b"
        vram_size_gb = 80.0
        is_external = true
        supports_tools = true
        [models.backend]
        type = "sglang"
        endpoint = "http://127.0.0.1:30000"

        [profiles.performance]
        soft_limit_gb = 100.0
        hard_limit_gb = 110.0
        fallback_profile = "conservative"
        artifact_extraction_model = "coder:7b"
        [profiles.performance.roles]
        router = "router:20b"
        coder = "coder:7b"
        reasoning = "reasoner:24b"
        research = "reasoner:24b"
        math = "coder:7b"
        [profiles.performance.fetch_limits]
        default = 5
        reasoning = 3

        [profiles.conservative]
        soft_limit_gb = 12.0
        hard_limit_gb = 16.0
        conservative_mode = true
        [profiles.conservative.roles]
        router = "router:20b"
        coder = "coder:7b"
        reasoning = "router:20b"
        research = "router:20b"
        math = "coder:7b"
        [profiles.conservative.fetch_limits]
        default = 2
    "#;

    #[test]
    fn test_sample_document_parses() {
        let doc = ModelsDocument::from_toml(SAMPLE_DOCUMENT).unwrap();
        assert_eq!(doc.models.len(), 4);
        assert_eq!(doc.profiles.len(), 2);

        let performance = &doc.profiles["performance"];
        assert_eq!(performance.profile_name, "performance");
        assert_eq!(performance.fallback_profile.as_deref(), Some("conservative"));
        assert_eq!(performance.roles.router, "router:20b");
    }

    #[test]
    fn test_unknown_role_model_rejected() {
        let doc = SAMPLE_DOCUMENT.replace("coder = \"coder:7b\"", "coder = \"ghost:1b\"");
        let err = ModelsDocument::from_toml(&doc).unwrap_err();
        assert!(err.to_string().contains("ghost:1b"));
    }

    #[test]
    fn test_inverted_limits_rejected() {
        let doc = SAMPLE_DOCUMENT.replace("hard_limit_gb = 110.0", "hard_limit_gb = 90.0");
        let err = ModelsDocument::from_toml(&doc).unwrap_err();
        assert!(err.to_string().contains("hard_limit_gb >= soft_limit_gb"));
    }

    #[test]
    fn test_missing_fallback_rejected() {
        let doc =
            SAMPLE_DOCUMENT.replace("fallback_profile = \"conservative\"", "fallback_profile = \"none\"");
        let err = ModelsDocument::from_toml(&doc).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_config_for_test_defaults() {
        let config = Config::for_test();
        assert_eq!(config.max_queue_size, 50);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.vram_crash_threshold, 3);
        assert!(config.enable_streaming);
    }
}

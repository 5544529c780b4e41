//! # Model Capability Registry
//!
//! Static, read-mostly description of every model the system may be asked to
//! serve: which backend hosts it, how much VRAM it needs, its eviction
//! priority class, and what generation features it supports. Loaded from the
//! models document at startup; any model absent from this registry cannot be
//! requested.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::GatewayError;

/// Eviction priority class. Lower discriminant = more important.
/// `Critical` models are never evicted under any policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelPriority {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
}

impl ModelPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Normal => "NORMAL",
            Self::Low => "LOW",
        }
    }

    /// Parse a priority name, defaulting to `Normal` on unknown input.
    pub fn parse_or_normal(value: &str) -> Self {
        match value.to_uppercase().as_str() {
            "CRITICAL" => Self::Critical,
            "HIGH" => Self::High,
            "LOW" => Self::Low,
            _ => Self::Normal,
        }
    }
}

/// Concrete serving engine behind a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Ollama,
    Sglang,
    Vllm,
    TrtLlm,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::Sglang => "sglang",
            Self::Vllm => "vllm",
            Self::TrtLlm => "trt_llm",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a backend lives and what engine speaks there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub endpoint: String,
}

/// Wire format of the thinking parameter a model accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingFormat {
    /// `think: true`
    #[default]
    Bool,
    /// `think: "high" | "medium" | "low"`
    Level,
}

/// Everything the orchestrator and agent runner need to know about a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCapability {
    pub model_id: String,
    pub backend: BackendSpec,
    pub vram_size_gb: f64,
    #[serde(default = "default_priority")]
    pub priority: ModelPriority,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_thinking: bool,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub thinking_format: ThinkingFormat,
    #[serde(default = "default_thinking_level")]
    pub default_thinking_level: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_seconds: u64,
    /// External models live on a long-lived host server; the orchestrator
    /// tracks them for visibility but never drives their lifecycle.
    #[serde(default)]
    pub is_external: bool,
}

fn default_priority() -> ModelPriority {
    ModelPriority::Normal
}

fn default_thinking_level() -> String {
    "high".to_string()
}

fn default_keep_alive() -> u64 {
    300
}

/// Read-only lookup table of model capabilities, keyed by model id.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    models: HashMap<String, ModelCapability>,
}

impl CapabilityRegistry {
    pub fn new(models: Vec<ModelCapability>) -> Self {
        let models = models
            .into_iter()
            .map(|m| (m.model_id.clone(), m))
            .collect();
        Self { models }
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelCapability> {
        self.models.get(model_id)
    }

    /// Lookup that surfaces the spec's ConfigError for unknown models.
    pub fn require(&self, model_id: &str) -> Result<&ModelCapability, GatewayError> {
        self.models
            .get(model_id)
            .ok_or_else(|| GatewayError::Config(format!("model {} not in capability registry", model_id)))
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    pub fn model_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.models.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn all(&self) -> impl Iterator<Item = &ModelCapability> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

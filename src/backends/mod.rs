//! # Backend Manager
//!
//! Backend-agnostic facade over the concrete serving engines. Each engine is
//! a variant of the [`Backend`] sum type with a common capability set:
//! load, unload, list_loaded, chat, and stream_chat. The manager resolves a
//! model id to its backend spec through the capability registry and
//! dispatches to the right driver.
//!
//! ## Supported engines
//!
//! - **Ollama**: native `/api/chat` NDJSON streaming, `/api/ps` listing,
//!   keep_alive-driven load/unload.
//! - **SGLang / vLLM / TRT-LLM**: OpenAI-compatible `/v1/chat/completions`
//!   with SSE streaming. Lifecycle operations are advisory; these servers
//!   host a fixed model set.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::Stream;

use crate::capabilities::{BackendKind, BackendSpec, CapabilityRegistry};
use crate::core::http_client::HttpClientBuilder;
use crate::error::GatewayError;

pub mod ollama;
pub mod openai_compat;

pub use ollama::OllamaBackend;
pub use openai_compat::OpenAiCompatBackend;

/// A single chat turn sent to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
        }
    }
}

/// Declaration of a callable tool, engine-agnostic. Drivers wrap it in their
/// wire envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Generation request shared by all drivers.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    /// Thinking parameter in the model's expected shape (`true` or a level
    /// string), when enabled.
    pub think: Option<serde_json::Value>,
    pub keep_alive_seconds: u64,
    pub tools: Vec<ToolDefinition>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: 0.7,
            think: None,
            keep_alive_seconds: 300,
            tools: Vec::new(),
        }
    }
}

/// Buffered generation result.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    /// Output token count when the engine reports one.
    pub eval_count: Option<u64>,
}

/// One frame of a streamed generation.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Text payload.
    Content(String),
    /// The model requested a tool invocation.
    ToolCall(ToolCallRequest),
    /// Terminal frame; carries the output token count when reported.
    Done { eval_count: Option<u64> },
}

/// Lazily produced stream of generation events.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, GatewayError>> + Send>>;

/// # Backend Sum Type
///
/// Dispatch over concrete engines without trait objects. Drivers share the
/// manager's pooled HTTP clients, so constructing a variant per call is
/// cheap.
#[derive(Debug)]
pub enum Backend {
    Ollama(OllamaBackend),
    OpenAiCompat(OpenAiCompatBackend),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ollama(b) => b.name(),
            Self::OpenAiCompat(b) => b.name(),
        }
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome, GatewayError> {
        match self {
            Self::Ollama(b) => b.chat(request).await,
            Self::OpenAiCompat(b) => b.chat(request).await,
        }
    }

    pub async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, GatewayError> {
        match self {
            Self::Ollama(b) => b.stream_chat(request).await,
            Self::OpenAiCompat(b) => b.stream_chat(request).await,
        }
    }

    pub async fn warm_load(
        &self,
        model_id: &str,
        keep_alive_seconds: u64,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        match self {
            Self::Ollama(b) => b.warm_load(model_id, keep_alive_seconds, timeout).await,
            Self::OpenAiCompat(b) => b.warm_load(timeout).await,
        }
    }

    pub async fn unload(&self, model_id: &str) -> Result<(), GatewayError> {
        match self {
            Self::Ollama(b) => b.unload(model_id).await,
            Self::OpenAiCompat(b) => b.unload(model_id).await,
        }
    }

    pub async fn list_loaded(&self) -> Result<HashSet<String>, GatewayError> {
        match self {
            Self::Ollama(b) => b.list_loaded().await,
            Self::OpenAiCompat(b) => b.list_loaded().await,
        }
    }
}

/// # Backend Manager
///
/// Resolves model ids to backend drivers via the capability registry and
/// exposes the common engine operations keyed by model or backend kind.
pub struct BackendManager {
    capabilities: Arc<CapabilityRegistry>,
    /// Buffered calls with the configured request timeout.
    client: reqwest::Client,
    /// Streaming calls without a request-level timeout.
    stream_client: reqwest::Client,
}

impl BackendManager {
    pub fn new(capabilities: Arc<CapabilityRegistry>, request_timeout: Duration) -> Self {
        let client = HttpClientBuilder::new()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let stream_client = HttpClientBuilder::streaming()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            capabilities,
            client,
            stream_client,
        }
    }

    /// Driver for an explicit backend spec.
    pub fn driver(&self, spec: &BackendSpec) -> Backend {
        match spec.kind {
            BackendKind::Ollama => Backend::Ollama(OllamaBackend::new(
                self.client.clone(),
                self.stream_client.clone(),
                spec.endpoint.clone(),
            )),
            BackendKind::Sglang | BackendKind::Vllm | BackendKind::TrtLlm => {
                Backend::OpenAiCompat(OpenAiCompatBackend::new(
                    self.client.clone(),
                    self.stream_client.clone(),
                    spec.endpoint.clone(),
                    spec.kind,
                ))
            }
        }
    }

    /// Driver for a model id, resolved through the capability registry.
    pub fn driver_for_model(&self, model_id: &str) -> Result<Backend, GatewayError> {
        let caps = self.capabilities.require(model_id)?;
        Ok(self.driver(&caps.backend))
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome, GatewayError> {
        self.driver_for_model(&request.model)?.chat(request).await
    }

    pub async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, GatewayError> {
        self.driver_for_model(&request.model)?
            .stream_chat(request)
            .await
    }

    /// Unload a model from its backend. `kind` is cross-checked against the
    /// registry so a stale registry entry cannot unload a homonym elsewhere.
    pub async fn unload(&self, model_id: &str, kind: BackendKind) -> Result<(), GatewayError> {
        let caps = self.capabilities.require(model_id)?;
        if caps.backend.kind != kind {
            return Err(GatewayError::Config(format!(
                "model {} is registered on {} but unload was requested for {}",
                model_id, caps.backend.kind, kind
            )));
        }
        self.driver(&caps.backend).unload(model_id).await
    }

    /// Models actually resident on the first configured endpoint of `kind`.
    /// Returns `None` when no model uses that backend kind.
    pub async fn list_loaded(
        &self,
        kind: BackendKind,
    ) -> Result<Option<HashSet<String>>, GatewayError> {
        let Some(spec) = self
            .capabilities
            .all()
            .find(|caps| caps.backend.kind == kind)
            .map(|caps| caps.backend.clone())
        else {
            return Ok(None);
        };
        let loaded = self.driver(&spec).list_loaded().await?;
        Ok(Some(loaded))
    }
}

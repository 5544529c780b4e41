//! # LLM Agent Runner
//!
//! Streaming interface over the chosen backend. Owns prompt assembly,
//! thinking-parameter negotiation, tool-call budgeting, reference capture,
//! and the reasoning-tag/spacing/status filter pipeline. Every failure path
//! reports the model as crashed so the circuit breaker observes it.

pub mod filters;
pub mod prompts;
pub mod tools;

use futures_util::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::{BackendManager, ChatMessage, ChatRequest, StreamEvent, ToolCallRequest};
use crate::capabilities::{CapabilityRegistry, ModelCapability, ThinkingFormat};
use crate::error::GatewayError;
use crate::profiles::ProfileManager;
use crate::router::{RouteConfig, RouteKind};
use crate::vram::VramOrchestrator;

pub use filters::{ChunkFilter, FilterPipeline, SpacingFixer, StatusLineSuppressor, ThinkTagFilter};
pub use prompts::PromptComposer;
pub use tools::{
    ContentStripper, FetchResult, HttpWebTool, Reference, SearchHit, ToolExecutor, WebTool,
};

/// Upper bound on model→tool→model rounds within one generation.
const MAX_TOOL_ROUNDS: usize = 8;

/// Completed generation.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub content: String,
    pub model: String,
    pub references: Vec<Reference>,
    /// Characters stripped from `<think>` spans; feeds tokens/sec.
    pub thinking_chars: usize,
    /// Output token count when the backend reported one.
    pub output_tokens: Option<u64>,
}

/// Caller-resolved generation parameters.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub thinking_enabled: Option<bool>,
    pub user_base_prompt: Option<String>,
    pub cancel: CancellationToken,
}

pub struct AgentRunner {
    backends: Arc<BackendManager>,
    capabilities: Arc<CapabilityRegistry>,
    profiles: Arc<ProfileManager>,
    vram: Arc<VramOrchestrator>,
    web: Arc<dyn WebTool>,
    composer: PromptComposer,
    status_counter: AtomicUsize,
}

impl AgentRunner {
    pub fn new(
        backends: Arc<BackendManager>,
        capabilities: Arc<CapabilityRegistry>,
        profiles: Arc<ProfileManager>,
        vram: Arc<VramOrchestrator>,
        web: Arc<dyn WebTool>,
    ) -> Self {
        Self {
            backends,
            capabilities,
            profiles,
            vram,
            web,
            composer: PromptComposer::new(),
            status_counter: AtomicUsize::new(0),
        }
    }

    /// Resolve the thinking parameter for a model on a route. Explicit user
    /// preference wins; auto mode enables thinking only on RESEARCH.
    fn thinking_value(
        caps: &ModelCapability,
        route: RouteKind,
        user_preference: Option<bool>,
    ) -> Option<serde_json::Value> {
        let enabled = match user_preference {
            Some(false) => false,
            Some(true) => {
                if !caps.supports_thinking {
                    warn!(
                        "⚠️  User requested thinking mode but {} doesn't support it",
                        caps.model_id
                    );
                }
                caps.supports_thinking
            }
            None => caps.supports_thinking && route == RouteKind::Research,
        };

        if !enabled {
            return None;
        }
        Some(match caps.thinking_format {
            ThinkingFormat::Level => json!(caps.default_thinking_level),
            ThinkingFormat::Bool => json!(true),
        })
    }

    /// Rotating status indicator, varied per route and thinking mode.
    fn status_indicator(&self, route: RouteKind, thinking: bool) -> String {
        let messages: &[&str] = if thinking {
            &["*Thinking...*", "*Analyzing...*", "*Considering...*", "*Pondering...*"]
        } else {
            match route {
                RouteKind::Research => {
                    &["*Researching...*", "*Gathering information...*", "*Looking into this...*"]
                }
                RouteKind::SimpleCode => &["*Crafting code...*", "*Writing...*", "*Coding...*"],
                _ => &["*Processing...*", "*Working on it...*", "*One moment...*"],
            }
        };
        let index = self.status_counter.fetch_add(1, Ordering::Relaxed) % messages.len();
        format!("{}\n\n", messages[index])
    }

    async fn build_request(
        &self,
        context: &[ChatMessage],
        route_config: &RouteConfig,
        options: &GenerationOptions,
        caps: &ModelCapability,
    ) -> (ChatRequest, Option<ToolExecutor>, Option<serde_json::Value>) {
        let system_prompt = self
            .composer
            .compose(route_config, options.user_base_prompt.as_deref());

        let mut messages = Vec::with_capacity(context.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend_from_slice(context);

        // The execution model sees the filtered prompt when the response is
        // destined to become a file.
        if let Some(filtered) = &route_config.filtered_prompt {
            if let Some(last) = messages.last_mut() {
                if last.role == "user" {
                    last.content = filtered.clone();
                    debug!("🧹 Using filtered prompt for execution model");
                }
            }
        }

        let thinking = Self::thinking_value(caps, route_config.route, options.thinking_enabled);

        let mut request = ChatRequest::new(caps.model_id.clone(), messages);
        request.temperature = options.temperature;
        request.keep_alive_seconds = caps.keep_alive_seconds;
        request.think = thinking.clone();

        let executor = if caps.supports_tools {
            let profile = self.profiles.get_active_profile().await;
            let fetch_limit = profile.fetch_limit_for_route(route_config.route);
            if fetch_limit >= 0 {
                info!(
                    "🔧 Providing tools to {} (max {} fetches, profile={}, route={})",
                    caps.model_id,
                    fetch_limit,
                    profile.profile_name,
                    route_config.route.as_str()
                );
            } else {
                info!(
                    "🔧 Providing tools to {} (no fetch limit, profile={}, route={})",
                    caps.model_id,
                    profile.profile_name,
                    route_config.route.as_str()
                );
            }
            request.tools = ToolExecutor::definitions();
            Some(ToolExecutor::new(self.web.clone(), fetch_limit))
        } else {
            info!("⚠️  Model {} doesn't support tools", caps.model_id);
            None
        };

        (request, executor, thinking)
    }

    /// Report a failed generation to the orchestrator so the breaker sees it.
    async fn report_crash(&self, model_id: &str, error: &GatewayError) {
        let reason = if error.is_connection_class() {
            "connection_error"
        } else {
            "generation_failure"
        };
        self.vram
            .mark_model_unloaded(model_id, true, Some(reason))
            .await;
    }

    /// Buffered generation with tool rounds. Used directly for non-streaming
    /// processing and for empty-stream retries.
    pub async fn generate_with_route(
        &self,
        context: &[ChatMessage],
        route_config: &RouteConfig,
        options: &GenerationOptions,
    ) -> Result<GenerationResult, GatewayError> {
        let caps = self.capabilities.require(&route_config.model)?.clone();

        self.vram.request_model_load(&caps.model_id).await?;
        self.vram.mark_model_accessed(&caps.model_id).await;

        let (mut request, executor, _thinking) =
            self.build_request(context, route_config, options, &caps).await;

        let mut eval_count = None;
        let outcome = async {
            for _round in 0..MAX_TOOL_ROUNDS {
                if options.cancel.is_cancelled() {
                    return Err(GatewayError::Cancelled {
                        request_id: String::new(),
                    });
                }

                let outcome = self.backends.chat(&request).await?;
                eval_count = outcome.eval_count.or(eval_count);

                let Some(executor) = executor.as_ref().filter(|_| !outcome.tool_calls.is_empty())
                else {
                    return Ok(outcome.content);
                };
                self.append_tool_round(&mut request, &outcome.content, &outcome.tool_calls, executor)
                    .await;
            }
            Err(GatewayError::Generation(format!(
                "tool budget exhausted after {} rounds",
                MAX_TOOL_ROUNDS
            )))
        }
        .await;

        let raw = match outcome {
            Ok(content) => content,
            Err(e) => {
                self.report_crash(&caps.model_id, &e).await;
                return Err(e);
            }
        };

        // Same filters as streaming, applied to the whole buffer at once.
        let (mut pipeline, think_stats) = FilterPipeline::standard(false);
        let mut content = pipeline.apply(&raw);
        content.push_str(&pipeline.flush());

        Ok(GenerationResult {
            content: content.trim().to_string(),
            model: caps.model_id.clone(),
            references: executor.map(|e| e.references()).unwrap_or_default(),
            thinking_chars: think_stats.discarded_chars(),
            output_tokens: eval_count,
        })
    }

    /// Streaming generation: emits filtered chunks through `chunks` as they
    /// arrive, returning the assembled result at the end. Tool rounds stream
    /// too; only the final round's text usually reaches the user since tool
    /// rounds rarely carry prose.
    pub async fn stream_with_route(
        &self,
        context: &[ChatMessage],
        route_config: &RouteConfig,
        options: &GenerationOptions,
        chunks: mpsc::Sender<String>,
    ) -> Result<GenerationResult, GatewayError> {
        let caps = self.capabilities.require(&route_config.model)?.clone();

        self.vram.request_model_load(&caps.model_id).await?;
        self.vram.mark_model_accessed(&caps.model_id).await;

        let (mut request, executor, thinking) =
            self.build_request(context, route_config, options, &caps).await;

        // Status indicator first; the suppressor then drops any LLM-generated
        // lookalike lines so the client never shows two spinners.
        let status = self.status_indicator(route_config.route, thinking.is_some());
        let _ = chunks.send(status).await;

        let (mut pipeline, think_stats) = FilterPipeline::standard(true);
        let mut assembled = String::new();
        let mut eval_count = None;

        let outcome = self
            .drive_stream(
                &mut request,
                executor.as_ref(),
                options,
                &mut pipeline,
                &mut assembled,
                &mut eval_count,
                &chunks,
            )
            .await;

        if let Err(e) = outcome {
            self.report_crash(&caps.model_id, &e).await;
            return Err(e);
        }

        let remainder = pipeline.flush();
        if !remainder.is_empty() {
            debug!("🔄 Flushing final filter buffer: {} chars", remainder.len());
            assembled.push_str(&remainder);
            let _ = chunks.send(remainder).await;
        }

        debug!(
            "📊 Streaming complete: {} chars, {} thinking chars",
            assembled.len(),
            think_stats.discarded_chars()
        );

        Ok(GenerationResult {
            content: assembled.trim().to_string(),
            model: caps.model_id.clone(),
            references: executor.map(|e| e.references()).unwrap_or_default(),
            thinking_chars: think_stats.discarded_chars(),
            output_tokens: eval_count,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_stream(
        &self,
        request: &mut ChatRequest,
        executor: Option<&ToolExecutor>,
        options: &GenerationOptions,
        pipeline: &mut FilterPipeline,
        assembled: &mut String,
        eval_count: &mut Option<u64>,
        chunks: &mpsc::Sender<String>,
    ) -> Result<(), GatewayError> {
        for _round in 0..MAX_TOOL_ROUNDS {
            // Cancellation is honored at backend boundaries only; an
            // in-flight generation is never interrupted.
            if options.cancel.is_cancelled() {
                return Err(GatewayError::Cancelled {
                    request_id: String::new(),
                });
            }

            let mut stream = self.backends.stream_chat(request).await?;
            let mut round_text = String::new();
            let mut tool_calls: Vec<ToolCallRequest> = Vec::new();

            while let Some(event) = stream.next().await {
                match event? {
                    StreamEvent::Content(text) => {
                        round_text.push_str(&text);
                        let filtered = pipeline.apply(&text);
                        if !filtered.is_empty() {
                            assembled.push_str(&filtered);
                            // The consumer applies its own pacing; a slow
                            // client backpressures us here instead of
                            // dropping chunks.
                            if chunks.send(filtered).await.is_err() {
                                debug!("chunk consumer dropped, continuing to assemble");
                            }
                        }
                    }
                    StreamEvent::ToolCall(call) => tool_calls.push(call),
                    StreamEvent::Done { eval_count: count } => {
                        *eval_count = count.or(*eval_count);
                    }
                }
            }

            let Some(executor) = executor.filter(|_| !tool_calls.is_empty()) else {
                return Ok(());
            };
            self.append_tool_round(request, &round_text, &tool_calls, executor)
                .await;
        }

        Err(GatewayError::Generation(format!(
            "tool budget exhausted after {} rounds",
            MAX_TOOL_ROUNDS
        )))
    }

    /// Execute a round's tool calls and extend the conversation with the
    /// assistant turn and the tool results.
    async fn append_tool_round(
        &self,
        request: &mut ChatRequest,
        assistant_text: &str,
        tool_calls: &[ToolCallRequest],
        executor: &ToolExecutor,
    ) {
        request
            .messages
            .push(ChatMessage::assistant(assistant_text.to_string()));
        for call in tool_calls {
            debug!("🔧 Executing tool {}", call.name);
            let result = executor.execute(call).await;
            request.messages.push(ChatMessage::tool(result));
        }
    }
}

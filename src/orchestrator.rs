//! # Request Orchestrator
//!
//! Per-request conductor: loads conversation context, resolves preferences
//! and routing, drives the agent runner, injects citation links, persists
//! the exchange, and applies artifact postprocessing. Contains no model or
//! transport logic of its own.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{AgentRunner, GenerationOptions, Reference};
use crate::backends::ChatMessage;
use crate::error::GatewayError;
use crate::preferences::{PreferenceResolver, ResolvedPreferences};
use crate::profiles::ProfileManager;
use crate::queue::QueuedRequest;
use crate::router::{RouteConfig, RouterService};
use crate::storage::{
    estimate_tokens, Artifact, ArtifactExtractor, ConversationStore, NewMessage, UserPreferences,
    UserStore,
};

/// Don't replace a status indicator until this much real content arrived.
const MIN_CONTENT_LENGTH: usize = 20;

/// Final result of one processed request.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub request_id: String,
    pub response: String,
    pub model: String,
    pub tokens_used: u64,
    pub output_tokens: u64,
    pub thinking_tokens: u64,
    pub generation_time: Duration,
    pub artifacts: Vec<Artifact>,
    /// Returned so retries can reuse the route without re-classifying.
    pub route_config: RouteConfig,
}

impl ProcessOutcome {
    /// Tokens per second including reasoning output.
    pub fn tokens_per_second(&self) -> f64 {
        let seconds = self.generation_time.as_secs_f64();
        if seconds > 0.0 {
            (self.output_tokens + self.thinking_tokens) as f64 / seconds
        } else {
            0.0
        }
    }
}

/// Replace inline `【title】` citations with markdown links. Exact title
/// match first, then substring containment either way; unmatched citations
/// stay as-is with a warning. Already-linked markdown has no `【】` left, so
/// a second pass is a no-op.
pub fn inject_reference_urls(text: &str, references: &[Reference]) -> String {
    if references.is_empty() {
        return text.to_string();
    }

    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('【') {
        let Some(close_rel) = rest[open..].find('】') else {
            break;
        };
        let close = open + close_rel;
        output.push_str(&rest[..open]);

        let citation = &rest[open + '【'.len_utf8()..close];
        let normalized = citation.trim().to_lowercase();
        let matched = references
            .iter()
            .find(|r| r.title.trim().to_lowercase() == normalized)
            .or_else(|| {
                references.iter().find(|r| {
                    let title = r.title.trim().to_lowercase();
                    title.contains(&normalized) || normalized.contains(&title)
                })
            });

        match matched {
            Some(reference) => {
                output.push_str(&format!("[{}]({})", citation, reference.url));
            }
            None => {
                warn!("⚠️  No URL found for citation: 【{}】", citation);
                output.push_str(&rest[open..close + '】'.len_utf8()]);
            }
        }
        rest = &rest[close + '】'.len_utf8()..];
    }
    output.push_str(rest);
    output
}

/// Append extracted attachment content to the user message so the execution
/// model sees uploaded files inline.
fn build_user_content(request: &QueuedRequest) -> String {
    let mut content = request.message.clone();
    for attachment in &request.attachments {
        if !attachment.extracted_content.is_empty() {
            content.push_str(&format!(
                "\n\n[File: {}]\n{}",
                attachment.filename, attachment.extracted_content
            ));
        }
    }
    content
}

pub struct RequestOrchestrator {
    conversations: Arc<dyn ConversationStore>,
    users: Arc<dyn UserStore>,
    agent: Arc<AgentRunner>,
    router: Arc<RouterService>,
    resolver: PreferenceResolver,
    profiles: Arc<ProfileManager>,
    extractor: Arc<dyn ArtifactExtractor>,
    disable_token_budget: bool,
    default_token_budget: i64,
}

impl RequestOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        users: Arc<dyn UserStore>,
        agent: Arc<AgentRunner>,
        router: Arc<RouterService>,
        resolver: PreferenceResolver,
        profiles: Arc<ProfileManager>,
        extractor: Arc<dyn ArtifactExtractor>,
        disable_token_budget: bool,
        default_token_budget: i64,
    ) -> Self {
        Self {
            conversations,
            users,
            agent,
            router,
            resolver,
            profiles,
            extractor,
            disable_token_budget,
            default_token_budget,
        }
    }

    /// Shared preamble: fallback recovery probe, user bootstrap, budget
    /// check, context load.
    async fn prepare(
        &self,
        request: &QueuedRequest,
    ) -> Result<(UserPreferences, Vec<ChatMessage>, String), GatewayError> {
        self.profiles.check_and_recover().await;

        info!(
            "📥 Processing request {} from user {}: {:.80}",
            request.request_id, request.user_id, request.message
        );

        self.users
            .ensure_user(&request.user_id, self.default_token_budget)
            .await?;
        let prefs = self
            .users
            .preferences(&request.user_id)
            .await?
            .unwrap_or_default();

        if !self.disable_token_budget {
            let tokens = self.users.tokens(&request.user_id).await?;
            if let Some(tokens) = tokens {
                if tokens.tokens_remaining < request.estimated_tokens as i64 {
                    return Err(GatewayError::TokenBudgetExceeded {
                        remaining: tokens.tokens_remaining,
                    });
                }
            }
        }

        let stored = self
            .conversations
            .context(&request.conversation_id, &request.user_id)
            .await?;
        let mut context: Vec<ChatMessage> = stored
            .iter()
            .map(|m| ChatMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect();

        let user_content = build_user_content(request);
        context.push(ChatMessage::user(user_content.clone()));

        Ok((prefs, context, user_content))
    }

    /// Resolve preferences and (unless bypassed) classify the route.
    async fn resolve_route(
        &self,
        request: &QueuedRequest,
        prefs: &UserPreferences,
        user_content: &str,
    ) -> (RouteConfig, ResolvedPreferences) {
        let profile = self.profiles.get_active_profile().await;
        let resolved = self.resolver.resolve(request, prefs, &profile);

        let route_config = match &resolved.model {
            Some(model) if resolved.should_bypass_routing => {
                let config = self
                    .router
                    .bypass_config(
                        user_content,
                        &request.attachments,
                        model,
                        Some(&resolved.artifact_detection_model),
                    )
                    .await;
                info!(
                    "🎯 Bypassed routing via {}: {}",
                    resolved.model_source.as_str(),
                    model
                );
                config
            }
            _ => {
                let config = self
                    .router
                    .classify_request(
                        user_content,
                        &request.attachments,
                        Some(&resolved.artifact_detection_model),
                    )
                    .await;
                info!("🎯 Routed to {} via router", config.route.as_str());
                config
            }
        };

        (route_config, resolved)
    }

    fn generation_options(
        request: &QueuedRequest,
        prefs: &UserPreferences,
        resolved: &ResolvedPreferences,
    ) -> GenerationOptions {
        GenerationOptions {
            temperature: resolved.temperature,
            thinking_enabled: resolved.thinking_enabled,
            user_base_prompt: prefs.base_prompt.clone(),
            cancel: request.cancel.clone(),
        }
    }

    /// Non-streaming processing. `route_config` may be supplied by a retry
    /// to skip re-classification.
    pub async fn process(
        &self,
        request: &QueuedRequest,
        route_config: Option<RouteConfig>,
    ) -> Result<ProcessOutcome, GatewayError> {
        let (prefs, context, user_content) = self.prepare(request).await?;

        let (route_config, resolved) = match route_config {
            Some(config) => {
                info!("♻️  Reusing route config: {}", config.route.as_str());
                let profile = self.profiles.get_active_profile().await;
                let resolved = self.resolver.resolve(request, &prefs, &profile);
                (config, resolved)
            }
            None => self.resolve_route(request, &prefs, &user_content).await,
        };

        let options = Self::generation_options(request, &prefs, &resolved);
        let started = Instant::now();
        let result = self
            .agent
            .generate_with_route(&context, &route_config, &options)
            .await?;
        let generation_time = started.elapsed();

        if result.content.trim().is_empty() {
            warn!(
                "❌ Empty response from {} on route {}",
                result.model,
                route_config.route.as_str()
            );
            return Err(GatewayError::EmptyStream {
                model_id: result.model,
            });
        }

        self.finalize(
            request,
            &prefs,
            &resolved,
            route_config,
            result.content,
            result.references,
            result.output_tokens,
            result.thinking_chars,
            generation_time,
        )
        .await
    }

    /// Streaming processing. Accumulated post-filter content is pushed
    /// through `updates` as it grows; the worker applies client pacing.
    /// An empty final response is returned (not raised) so the worker can
    /// retry in non-streaming mode with the same route config.
    pub async fn process_stream(
        &self,
        request: &QueuedRequest,
        updates: mpsc::Sender<String>,
    ) -> Result<ProcessOutcome, GatewayError> {
        let (prefs, context, user_content) = self.prepare(request).await?;
        let (route_config, resolved) = self.resolve_route(request, &prefs, &user_content).await;
        let options = Self::generation_options(request, &prefs, &resolved);

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(64);
        let started = Instant::now();

        let mut agent_fut = Box::pin(self.agent.stream_with_route(
            &context,
            &route_config,
            &options,
            chunk_tx,
        ));

        // Accumulate chunks while the agent runs. The status indicator is
        // forwarded verbatim; real content replaces it only after enough
        // alphanumeric text arrived to avoid flashing fragments like "**".
        let mut agent_result = None;
        let mut accumulated = String::new();
        let mut status_pending = true;
        loop {
            tokio::select! {
                result = &mut agent_fut, if agent_result.is_none() => {
                    agent_result = Some(result);
                }
                chunk = chunk_rx.recv() => {
                    let Some(chunk) = chunk else { break };
                    if status_pending && accumulated.is_empty() && looks_like_status(&chunk) {
                        let _ = updates.send(chunk).await;
                        continue;
                    }

                    accumulated.push_str(&chunk);
                    if status_pending {
                        let meaningful = accumulated.trim().len() >= MIN_CONTENT_LENGTH
                            && accumulated.chars().any(|c| c.is_ascii_alphanumeric());
                        if !meaningful {
                            debug!("⏳ Waiting for meaningful content ({} chars)", accumulated.trim().len());
                            continue;
                        }
                        status_pending = false;
                    }
                    let _ = updates.send(accumulated.clone()).await;
                }
            }
        }

        let result = match agent_result {
            Some(result) => {
                drop(agent_fut);
                result?
            }
            // Channel closed before the agent resolved; await the remainder.
            None => agent_fut.await?,
        };
        let generation_time = started.elapsed();

        self.finalize(
            request,
            &prefs,
            &resolved,
            route_config,
            result.content,
            result.references,
            result.output_tokens,
            result.thinking_chars,
            generation_time,
        )
        .await
    }

    /// Citation injection, persistence, artifact postprocessing, and token
    /// accounting shared by both processing modes.
    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        request: &QueuedRequest,
        prefs: &UserPreferences,
        resolved: &ResolvedPreferences,
        route_config: RouteConfig,
        content: String,
        references: Vec<Reference>,
        backend_output_tokens: Option<u64>,
        thinking_chars: usize,
        generation_time: Duration,
    ) -> Result<ProcessOutcome, GatewayError> {
        let mut response = content;
        if !references.is_empty() {
            response = inject_reference_urls(&response, &references);
            debug!("🔗 Injected URLs for {} captured references", references.len());
        }

        let message_id = request
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        self.conversations
            .add_message(NewMessage {
                conversation_id: request.conversation_id.clone(),
                message_id: message_id.clone(),
                user_id: request.user_id.clone(),
                role: "user".to_string(),
                content: request.message.clone(),
                token_count: request.estimated_tokens,
                model_used: prefs.preferred_model.clone(),
                generation_time_seconds: None,
            })
            .await?;

        let output_tokens = backend_output_tokens.unwrap_or_else(|| estimate_tokens(&response));
        let thinking_tokens = (thinking_chars as u64).div_ceil(4);

        self.conversations
            .add_message(NewMessage {
                conversation_id: request.conversation_id.clone(),
                message_id: format!("response_{}", message_id),
                user_id: request.user_id.clone(),
                role: "assistant".to_string(),
                content: response.clone(),
                token_count: output_tokens,
                model_used: Some(route_config.model.clone()),
                generation_time_seconds: Some(generation_time.as_secs_f64()),
            })
            .await?;

        // Artifact extraction is a fallback for responses that should become
        // files; skipped entirely for plain chat turns.
        let mut artifacts = Vec::new();
        if !response.trim().is_empty() && route_config.wants_output_artifact() {
            match self
                .extractor
                .extract(
                    &request.message,
                    &response,
                    resolved.artifact_extraction_model.as_deref(),
                )
                .await
            {
                Ok(extracted) if !extracted.is_empty() => {
                    info!("📦 Extracted {} artifact(s)", extracted.len());
                    artifacts = extracted;
                }
                Ok(_) => warn!(
                    "⚠️  OUTPUT_ARTIFACT detected but no artifacts extracted for {}",
                    request.request_id
                ),
                Err(e) => warn!("artifact extraction failed: {}", e),
            }
        }

        let tokens_used = request.estimated_tokens + output_tokens;
        self.users.record_usage(&request.user_id, tokens_used).await?;

        let preview: String = response.chars().take(120).collect();
        info!(
            "📤 Generated response for {}: {}",
            request.user_id,
            preview.replace('\n', " ")
        );

        Ok(ProcessOutcome {
            request_id: request.request_id.clone(),
            response,
            model: route_config.model.clone(),
            tokens_used,
            output_tokens,
            thinking_tokens,
            generation_time,
            artifacts,
            route_config,
        })
    }
}

/// Status-indicator shape: `*Something...*` possibly followed by blank lines.
fn looks_like_status(chunk: &str) -> bool {
    let trimmed = chunk.trim();
    trimmed.len() > 5
        && trimmed.starts_with('*')
        && trimmed.ends_with("...*")
        && !trimmed[1..trimmed.len() - 4].contains('*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs() -> Vec<Reference> {
        vec![
            Reference {
                title: "OpenAI Blog".into(),
                url: "https://openai.com/blog".into(),
            },
            Reference {
                title: "Rust Release Notes".into(),
                url: "https://blog.rust-lang.org".into(),
            },
        ]
    }

    #[test]
    fn test_exact_citation_replaced() {
        let text = "According to 【OpenAI Blog】, things changed.";
        let out = inject_reference_urls(text, &refs());
        assert_eq!(
            out,
            "According to [OpenAI Blog](https://openai.com/blog), things changed."
        );
        assert_eq!(out.matches("[OpenAI Blog]").count(), 1);
    }

    #[test]
    fn test_substring_citation_replaced() {
        let text = "Per 【the OpenAI Blog announcement】 yesterday.";
        let out = inject_reference_urls(text, &refs());
        // Citation contains the reference title, so it links.
        assert!(out.contains("](https://openai.com/blog)"));
    }

    #[test]
    fn test_unknown_citation_left_alone() {
        let text = "From 【Unknown Source】.";
        let out = inject_reference_urls(text, &refs());
        assert_eq!(out, text);
    }

    #[test]
    fn test_injection_is_idempotent() {
        let text = "See 【OpenAI Blog】 and 【Rust Release Notes】.";
        let once = inject_reference_urls(text, &refs());
        let twice = inject_reference_urls(&once, &refs());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_no_references_is_passthrough() {
        let text = "Citing 【Something】 here.";
        assert_eq!(inject_reference_urls(text, &[]), text);
    }

    #[test]
    fn test_case_insensitive_match() {
        let text = "see 【openai blog】";
        let out = inject_reference_urls(text, &refs());
        assert!(out.contains("](https://openai.com/blog)"));
    }

    #[test]
    fn test_status_shape_detection() {
        assert!(looks_like_status("*Thinking...*\n\n"));
        assert!(looks_like_status("*Crafting code...*"));
        assert!(!looks_like_status("regular text"));
        assert!(!looks_like_status("**bold**"));
        assert!(!looks_like_status("*hi*"));
    }

    #[test]
    fn test_build_user_content_appends_files() {
        let mut request = QueuedRequest::test_request("u", "analyze this");
        request.attachments.push(crate::queue::AttachmentRef {
            filename: "notes.txt".into(),
            content_type: Some("text/plain".into()),
            extracted_content: "file body".into(),
        });

        let content = build_user_content(&request);
        assert!(content.starts_with("analyze this"));
        assert!(content.contains("[File: notes.txt]"));
        assert!(content.contains("file body"));
    }
}

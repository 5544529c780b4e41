//! # Router
//!
//! Classify-then-route: a small router LLM assigns each turn to one of five
//! routes, two lightweight detectors flag artifact handling, and the active
//! profile's role map selects the execution model. Classification is
//! fail-open: anything unparseable lands on the most capable route.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::backends::{BackendManager, ChatMessage, ChatRequest};
use crate::profiles::ProfileManager;
use crate::queue::AttachmentRef;

/// The five request routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteKind {
    SelfHandle,
    SimpleCode,
    Reasoning,
    Research,
    Math,
}

impl RouteKind {
    pub const ALL: [RouteKind; 5] = [
        RouteKind::SelfHandle,
        RouteKind::SimpleCode,
        RouteKind::Reasoning,
        RouteKind::Research,
        RouteKind::Math,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelfHandle => "SELF_HANDLE",
            Self::SimpleCode => "SIMPLE_CODE",
            Self::Reasoning => "REASONING",
            Self::Research => "RESEARCH",
            Self::Math => "MATH",
        }
    }

    pub fn as_str_lower(&self) -> &'static str {
        match self {
            Self::SelfHandle => "self_handle",
            Self::SimpleCode => "simple_code",
            Self::Reasoning => "reasoning",
            Self::Research => "research",
            Self::Math => "math",
        }
    }
}

/// Preprocessing steps a request needs before generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Preprocessing {
    InputArtifact,
}

/// Postprocessing steps a response needs after generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Postprocessing {
    OutputArtifact,
}

/// Resolved execution plan for one turn. May be reused across retries to
/// skip re-classification.
#[derive(Debug, Clone)]
pub struct RouteConfig {
    pub route: RouteKind,
    pub model: String,
    pub preprocessing: Vec<Preprocessing>,
    pub postprocessing: Vec<Postprocessing>,
    /// User message stripped of filename/storage language, used only as the
    /// execution model's prompt when the response becomes a file.
    pub filtered_prompt: Option<String>,
    /// True when the model came from an explicit user or request choice.
    pub user_selected: bool,
}

impl RouteConfig {
    pub fn wants_output_artifact(&self) -> bool {
        self.postprocessing.contains(&Postprocessing::OutputArtifact)
    }

    pub fn has_input_artifact(&self) -> bool {
        self.preprocessing.contains(&Preprocessing::InputArtifact)
    }
}

/// Parse the router model's answer: exact match first, then first substring
/// hit, otherwise the most capable default.
pub fn parse_route(answer: &str) -> RouteKind {
    let normalized = answer.trim().to_uppercase();
    for route in RouteKind::ALL {
        if normalized == route.as_str() {
            return route;
        }
    }
    for route in RouteKind::ALL {
        if normalized.contains(route.as_str()) {
            warn!("⚠️  Extracted route from fuzzy answer: {}", route.as_str());
            return route;
        }
    }
    warn!("⚠️  Classification unclear: {:?}, defaulting to REASONING", answer);
    RouteKind::Reasoning
}

const CLASSIFICATION_PROMPT: &str = r#"You are a request classifier for an AI assistant system.

Analyze the user's request and classify it into ONE of these routes:

1. SELF_HANDLE - Simple questions, general conversation, quick facts
   Examples: "What is Python?", "Explain recursion", "Tell me about HTTP"

2. SIMPLE_CODE - Any coding task (simple or complex), bug fixes, design, architecture
   Examples: "Write a function to reverse a string", "Design a REST API",
             "Build a distributed caching system", "Fix this syntax error"

3. REASONING - Analytical tasks: comparisons, trade-off analysis, decision-making (with limited web research)
   Examples: "Compare REST vs GraphQL", "Should I use microservices or monolith?",
             "Analyze pros/cons of Redis vs Memcached"

4. RESEARCH - Deep research requiring extensive web searches and many sources
   Examples: "Research the history of Bitcoin regulation", "Find latest developments in quantum computing",
             "Investigate current state of AI legislation"

5. MATH - Mathematical problems, calculations, equations, integrals, derivatives
   Examples: "integrate 4x^6 + 2x^3 + 7x - 4", "solve the equation 2x + 5 = 13",
             "calculate the derivative of sin(x) * cos(x)"
   Keywords: integrate, derivative, differentiate, solve equation, calculate, evaluate, limit,
             summation, factorial, logarithm, exponential, trigonometric, matrix, vector

Output ONLY the route name (e.g., "SIMPLE_CODE"), nothing else."#;

const ARTIFACT_DETECTION_PROMPT: &str = r#"You decide whether the user wants their answer delivered as a file.

Answer YES when the request asks to save, export, or produce a named file
("save to notes.md", "make me a quicksort file", "put into a .txt").
Answer NO for ordinary questions and chat, even about files.

Output ONLY YES or NO."#;

const REPHRASE_PROMPT: &str = r#"Transform user requests by removing file/storage references. Keep the core task.

EXAMPLES:
"write a summary about climate change and save it to summary.txt" -> write a summary about climate change
"create me a quicksort file in c++" -> implement quicksort in c++
"explain quantum physics, put into explanation.md" -> explain quantum physics
"make a shopping list and save as list.txt" -> make a shopping list
"why btc pump from 89k to 92k? put into .md file" -> why btc pump from 89k to 92k?
"write a poem about spring, create poem.txt" -> write a poem about spring

Pattern: Remove filenames (.txt, .md, .py) and saving phrases ("save to", "put into", "create file"). Keep the action and topic.

Now transform:"#;

/// LLM-backed classification and artifact detection.
pub struct RouterService {
    backends: Arc<BackendManager>,
    profiles: Arc<ProfileManager>,
    /// Short keep-alive keeps the router warm between turns without pinning
    /// VRAM for long.
    router_keep_alive_seconds: u64,
}

impl RouterService {
    pub fn new(backends: Arc<BackendManager>, profiles: Arc<ProfileManager>) -> Self {
        Self {
            backends,
            profiles,
            router_keep_alive_seconds: 120,
        }
    }

    /// Classify a turn and derive its full route configuration.
    pub async fn classify_request(
        &self,
        user_message: &str,
        file_refs: &[AttachmentRef],
        artifact_detection_model: Option<&str>,
    ) -> RouteConfig {
        let route = self.classify_route(user_message).await;

        let input_artifact = !file_refs.is_empty();
        let output_artifact = self
            .detect_output_artifact(user_message, artifact_detection_model)
            .await;

        let filtered_prompt = if output_artifact {
            let rephrased = self.rephrase_for_content(user_message).await;
            info!(
                "✂️  Filtered prompt for clean generation: {:.60} → {:.60}",
                user_message, rephrased
            );
            Some(rephrased)
        } else {
            None
        };

        let profile = self.profiles.get_active_profile().await;
        RouteConfig {
            route,
            model: profile.model_for_route(route).to_string(),
            preprocessing: if input_artifact {
                vec![Preprocessing::InputArtifact]
            } else {
                Vec::new()
            },
            postprocessing: if output_artifact {
                vec![Postprocessing::OutputArtifact]
            } else {
                Vec::new()
            },
            filtered_prompt,
            user_selected: false,
        }
    }

    /// Route configuration for a bypassed (user-chosen) model. Routing is
    /// skipped but artifact detection still runs; users can still ask for
    /// file output.
    pub async fn bypass_config(
        &self,
        user_message: &str,
        file_refs: &[AttachmentRef],
        model: &str,
        artifact_detection_model: Option<&str>,
    ) -> RouteConfig {
        let input_artifact = !file_refs.is_empty();
        let output_artifact = self
            .detect_output_artifact(user_message, artifact_detection_model)
            .await;
        let filtered_prompt = if output_artifact {
            Some(self.rephrase_for_content(user_message).await)
        } else {
            None
        };

        RouteConfig {
            route: RouteKind::SelfHandle,
            model: model.to_string(),
            preprocessing: if input_artifact {
                vec![Preprocessing::InputArtifact]
            } else {
                Vec::new()
            },
            postprocessing: if output_artifact {
                vec![Postprocessing::OutputArtifact]
            } else {
                Vec::new()
            },
            filtered_prompt,
            user_selected: true,
        }
    }

    async fn router_chat(&self, system: &str, user: String, model: &str) -> Option<String> {
        let mut request = ChatRequest::new(
            model,
            vec![ChatMessage::system(system), ChatMessage::user(user)],
        );
        // Low temperature for deterministic classification output.
        request.temperature = 0.1;
        request.keep_alive_seconds = self.router_keep_alive_seconds;

        match self.backends.chat(&request).await {
            Ok(outcome) => Some(outcome.content),
            Err(e) => {
                warn!("router model call failed: {}", e);
                None
            }
        }
    }

    async fn classify_route(&self, user_message: &str) -> RouteKind {
        let router_model = self.profiles.get_active_profile().await.roles.router;
        info!("🔀 Classifying request: {:.100}", user_message);

        match self
            .router_chat(
                CLASSIFICATION_PROMPT,
                format!("USER REQUEST: {}", user_message),
                &router_model,
            )
            .await
        {
            Some(answer) => {
                let route = parse_route(&answer);
                info!("✅ Classified as: {}", route.as_str());
                route
            }
            // Most capable fallback.
            None => RouteKind::Reasoning,
        }
    }

    async fn detect_output_artifact(&self, user_message: &str, model: Option<&str>) -> bool {
        let detection_model = match model {
            Some(m) => m.to_string(),
            None => self.profiles.get_active_profile().await.roles.router,
        };

        match self
            .router_chat(
                ARTIFACT_DETECTION_PROMPT,
                user_message.to_string(),
                &detection_model,
            )
            .await
        {
            Some(answer) => answer.trim().to_uppercase().starts_with("YES"),
            None => false,
        }
    }

    /// Rephrase the message without file-creation language, falling back to
    /// the original on any failure.
    async fn rephrase_for_content(&self, user_message: &str) -> String {
        let router_model = self.profiles.get_active_profile().await.roles.router;
        match self
            .router_chat(
                REPHRASE_PROMPT,
                format!("Input: {}", user_message),
                &router_model,
            )
            .await
        {
            Some(answer) => {
                let mut rephrased = answer.trim().to_string();
                for prefix in ["Output:", "output:", "Rephrased:", "rephrased:"] {
                    if let Some(rest) = rephrased.strip_prefix(prefix) {
                        rephrased = rest.trim().to_string();
                    }
                }
                if rephrased.is_empty() {
                    user_message.to_string()
                } else {
                    rephrased
                }
            }
            None => user_message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_exact_match() {
        assert_eq!(parse_route("SIMPLE_CODE"), RouteKind::SimpleCode);
        assert_eq!(parse_route("  math\n"), RouteKind::Math);
        assert_eq!(parse_route("self_handle"), RouteKind::SelfHandle);
    }

    #[test]
    fn test_parse_substring_match() {
        assert_eq!(
            parse_route("The route is RESEARCH because it needs sources."),
            RouteKind::Research
        );
        assert_eq!(parse_route("Route: SIMPLE_CODE."), RouteKind::SimpleCode);
    }

    #[test]
    fn test_parse_defaults_to_reasoning() {
        assert_eq!(parse_route("no idea"), RouteKind::Reasoning);
        assert_eq!(parse_route(""), RouteKind::Reasoning);
    }

    #[test]
    fn test_parse_is_deterministic() {
        // Identical inputs classify identically.
        for _ in 0..3 {
            assert_eq!(parse_route("MATH"), parse_route("MATH"));
        }
    }

    #[test]
    fn test_route_config_flags() {
        let config = RouteConfig {
            route: RouteKind::Reasoning,
            model: "m".into(),
            preprocessing: vec![Preprocessing::InputArtifact],
            postprocessing: vec![Postprocessing::OutputArtifact],
            filtered_prompt: None,
            user_selected: false,
        };
        assert!(config.has_input_artifact());
        assert!(config.wants_output_artifact());
    }
}

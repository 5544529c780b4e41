//! Shared fixtures for the integration suites: a stubbed Ollama backend and
//! an application state wired against it.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use modelmux::server::{AppState, Collaborators};
use modelmux::storage::{MemoryConversationStore, MemoryUserStore, NoopArtifactExtractor};
use modelmux::vram::{CrashAlert, FixedMemoryMonitor};
use modelmux::{Config, ModelsDocument};

/// Models document with every endpoint pointing at the stub backend.
pub fn models_toml(endpoint: &str) -> String {
    format!(
        r#"
        [[models]]
        model_id = "router:20b"
        vram_size_gb = 14.0
        priority = "CRITICAL"
        supports_tools = false
        [models.backend]
        type = "ollama"
        endpoint = "{endpoint}"

        [[models]]
        model_id = "coder:7b"
        vram_size_gb = 6.0
        priority = "NORMAL"
        supports_tools = false
        [models.backend]
        type = "ollama"
        endpoint = "{endpoint}"

        [[models]]
        model_id = "reasoner:24b"
        vram_size_gb = 16.0
        priority = "HIGH"
        supports_tools = false
        supports_thinking = true
        [models.backend]
        type = "ollama"
        endpoint = "{endpoint}"

        [[models]]
        model_id = "fragile:30b"
        vram_size_gb = 20.0
        priority = "NORMAL"
        supports_tools = false
        [models.backend]
        type = "ollama"
        endpoint = "{endpoint}"

        [profiles.performance]
        soft_limit_gb = 100.0
        hard_limit_gb = 110.0
        fallback_profile = "conservative"
        [profiles.performance.roles]
        router = "router:20b"
        coder = "coder:7b"
        reasoning = "reasoner:24b"
        research = "fragile:30b"
        math = "coder:7b"
        [profiles.performance.fetch_limits]
        default = 5

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
    "#
    )
}

fn ndjson_chat(content: &str, eval_count: u64) -> String {
    format!(
        "{}\n{}\n",
        serde_json::json!({ "message": { "content": content }, "done": false }),
        serde_json::json!({ "message": { "content": "" }, "done": true, "eval_count": eval_count }),
    )
}

fn buffered_chat(content: &str) -> serde_json::Value {
    serde_json::json!({
        "message": { "content": content },
        "done": true,
        "eval_count": 10
    })
}

/// Stub Ollama speaking just enough of the API: lifecycle endpoints, router
/// prompts (classification / artifact detection / rephrase), and generation
/// in both modes.
pub struct StubBackend {
    pub server: MockServer,
}

impl StubBackend {
    pub async fn start() -> Self {
        let server = MockServer::start().await;

        // Lifecycle: loads and unloads always succeed.
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;
        // Reconciliation listing: nothing resident.
        Mock::given(method("GET"))
            .and(path("/api/ps"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "models": [] })),
            )
            .mount(&server)
            .await;

        Self { server }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Router model answers: classification route, artifact detection
    /// verdict, and a fixed rephrase.
    pub async fn mount_router(&self, route: &str, artifact_verdict: &str) {
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_string_contains("request classifier"))
            .respond_with(ResponseTemplate::new(200).set_body_json(buffered_chat(route)))
            .mount(&self.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_string_contains("delivered as a file"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(buffered_chat(artifact_verdict)),
            )
            .mount(&self.server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_string_contains("Transform user requests"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(buffered_chat("write the quicksort")),
            )
            .mount(&self.server)
            .await;
    }

    /// Streamed generation body for execution-model requests.
    pub async fn mount_streaming_generation(&self, content: &str) {
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_string_contains("helpful chat assistant"))
            .and(body_string_contains("\"stream\":true"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(ndjson_chat(content, 12), "application/x-ndjson"),
            )
            .mount(&self.server)
            .await;
    }

    /// Buffered generation body for execution-model requests.
    pub async fn mount_buffered_generation(&self, content: &str) {
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_string_contains("helpful chat assistant"))
            .and(body_string_contains("\"stream\":false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(buffered_chat(content)))
            .mount(&self.server)
            .await;
    }
}

/// Application state wired against the stub backend with pinned memory
/// readings and in-memory stores.
pub fn build_state(
    endpoint: &str,
    available_gb: f64,
) -> (AppState, mpsc::UnboundedReceiver<CrashAlert>) {
    let mut config = Config::for_test();
    config.active_profile = "performance".to_string();
    config.disable_token_budget = true;

    let document = ModelsDocument::from_toml(&models_toml(endpoint)).expect("valid document");
    let collaborators = Collaborators {
        conversations: Arc::new(MemoryConversationStore::new()),
        users: Arc::new(MemoryUserStore::new()),
        extractor: Arc::new(NoopArtifactExtractor),
        web: Arc::new(modelmux::agent::HttpWebTool::new(
            None,
            Duration::from_secs(2),
        )),
        memory: Arc::new(FixedMemoryMonitor::with_available_gb(available_gb)),
    };

    AppState::new(config, document, collaborators).expect("state builds")
}

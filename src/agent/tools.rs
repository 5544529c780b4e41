//! # Agent Tools
//!
//! Tool set offered to tool-capable execution models: web search and page
//! fetch. The fetch tool is wrapped in a per-request limiter whose counter
//! lives in the executor; once the route's budget is spent the tool returns
//! a synthetic "budget reached" result instead of failing the generation.
//! Successful fetches are captured as references for citation injection.
//!
//! The actual search/fetch transport is an external collaborator behind the
//! [`WebTool`] trait; the HTTP implementation here suits single-node
//! deployments with a SearxNG-style search endpoint.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

use crate::backends::{ToolCallRequest, ToolDefinition};
use crate::core::http_client::HttpClientBuilder;
use crate::error::GatewayError;

/// A search result row.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// A fetched page.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    pub title: String,
    pub content: String,
}

/// External search/fetch transport.
#[async_trait]
pub trait WebTool: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, GatewayError>;
    async fn fetch(&self, url: &str) -> Result<FetchResult, GatewayError>;
}

/// A captured citation source.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Reference {
    pub title: String,
    pub url: String,
}

/// Strips markdown and HTML noise from fetched page content before it is
/// handed to the model.
#[derive(Debug, Default)]
pub struct ContentStripper;

impl ContentStripper {
    pub fn strip(&self, text: &str) -> String {
        let mut output = String::with_capacity(text.len());
        let mut in_tag = false;
        for c in text.chars() {
            match c {
                '<' => in_tag = true,
                '>' if in_tag => in_tag = false,
                '*' | '|' if !in_tag => {}
                '#' if !in_tag => {}
                _ if in_tag => {}
                _ => output.push(c),
            }
        }

        // Collapse runs of blank lines left behind by removed markup.
        let mut result = String::with_capacity(output.len());
        let mut blank_run = 0;
        for line in output.lines() {
            let trimmed = line.trim_end();
            if trimmed.trim().is_empty() || trimmed.trim().chars().all(|c| c == '-' || c == '=') {
                blank_run += 1;
                if blank_run > 1 {
                    continue;
                }
                result.push('\n');
            } else {
                blank_run = 0;
                result.push_str(trimmed);
                result.push('\n');
            }
        }
        result.trim().to_string()
    }
}

/// Per-request tool executor: owns the fetch budget counter and the captured
/// reference list.
pub struct ToolExecutor {
    web: std::sync::Arc<dyn WebTool>,
    /// `-1` means unlimited.
    fetch_limit: i64,
    fetch_count: AtomicI64,
    references: Mutex<Vec<Reference>>,
    stripper: ContentStripper,
}

impl ToolExecutor {
    pub fn new(web: std::sync::Arc<dyn WebTool>, fetch_limit: i64) -> Self {
        Self {
            web,
            fetch_limit,
            fetch_count: AtomicI64::new(0),
            references: Mutex::new(Vec::new()),
            stripper: ContentStripper,
        }
    }

    /// Declarations for the tool-capable model.
    pub fn definitions() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "web_search".to_string(),
                description: "Search the web and return result titles, URLs, and snippets."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Search query" }
                    },
                    "required": ["query"]
                }),
            },
            ToolDefinition {
                name: "fetch_webpage".to_string(),
                description: "Fetch a web page and return its readable text content.".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "description": "Absolute URL to fetch" }
                    },
                    "required": ["url"]
                }),
            },
        ]
    }

    /// Execute one tool call, returning the tool-result payload as a JSON
    /// string. Tool failures become structured error payloads, never
    /// generation failures.
    pub async fn execute(&self, call: &ToolCallRequest) -> String {
        match call.name.as_str() {
            "web_search" => self.run_search(&call.arguments).await,
            "fetch_webpage" => self.run_fetch(&call.arguments).await,
            other => json!({ "error": format!("unknown tool {}", other) }).to_string(),
        }
    }

    /// References captured from successful fetches, in call order.
    pub fn references(&self) -> Vec<Reference> {
        self.references.lock().expect("references poisoned").clone()
    }

    pub fn fetches_used(&self) -> i64 {
        self.fetch_count.load(Ordering::Relaxed)
    }

    async fn run_search(&self, arguments: &Value) -> String {
        let Some(query) = arguments.get("query").and_then(Value::as_str) else {
            return json!({ "error": "missing query argument" }).to_string();
        };

        match self.web.search(query).await {
            Ok(hits) => {
                let rows: Vec<Value> = hits
                    .iter()
                    .take(8)
                    .map(|hit| {
                        json!({ "title": hit.title, "url": hit.url, "snippet": hit.snippet })
                    })
                    .collect();
                json!({ "results": rows }).to_string()
            }
            Err(e) => {
                warn!("web_search failed: {}", e);
                json!({ "error": format!("search failed: {}", e) }).to_string()
            }
        }
    }

    async fn run_fetch(&self, arguments: &Value) -> String {
        let Some(url) = arguments.get("url").and_then(Value::as_str) else {
            return json!({ "error": "missing url argument" }).to_string();
        };

        // Budget check before the call; exhaustion is a synthetic result the
        // model can act on, never an error.
        if self.fetch_limit >= 0 && self.fetch_count.load(Ordering::Relaxed) >= self.fetch_limit {
            warn!("🚫 Fetch limit reached ({} fetches)", self.fetch_limit);
            return json!({
                "error": format!(
                    "Fetch limit reached ({} fetches). Please synthesize the information you already have.",
                    self.fetch_limit
                )
            })
            .to_string();
        }

        let count = self.fetch_count.fetch_add(1, Ordering::Relaxed) + 1;
        if self.fetch_limit >= 0 {
            info!("📄 Fetch {}/{}: {}", count, self.fetch_limit, url);
        } else {
            info!("📄 Fetch {} (unlimited): {}", count, url);
        }

        match self.web.fetch(url).await {
            Ok(result) => {
                let content = self.stripper.strip(&result.content);
                {
                    let mut references = self.references.lock().expect("references poisoned");
                    if !references.iter().any(|r| r.url == result.url) {
                        references.push(Reference {
                            title: result.title.clone(),
                            url: result.url.clone(),
                        });
                    }
                }
                json!({ "url": result.url, "title": result.title, "content": content }).to_string()
            }
            Err(e) => {
                warn!("fetch_webpage failed for {}: {}", url, e);
                json!({ "error": format!("fetch failed: {}", e) }).to_string()
            }
        }
    }
}

/// HTTP-backed [`WebTool`]: SearxNG-style JSON search plus a plain page
/// fetch with a hard per-request timeout.
pub struct HttpWebTool {
    client: reqwest::Client,
    search_endpoint: Option<String>,
}

impl HttpWebTool {
    pub fn new(search_endpoint: Option<String>, fetch_timeout: Duration) -> Self {
        let client = HttpClientBuilder::fetch(fetch_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            search_endpoint,
        }
    }

    fn extract_title(html: &str) -> String {
        // ASCII case-insensitive byte search keeps offsets valid on pages
        // with non-ASCII content.
        let Some(start) = Self::find_ascii_ci(html.as_bytes(), b"<title") else {
            return String::new();
        };
        let Some(open_end) = html[start..].find('>').map(|i| start + i + 1) else {
            return String::new();
        };
        let Some(end) =
            Self::find_ascii_ci(html[open_end..].as_bytes(), b"</title>").map(|i| open_end + i)
        else {
            return String::new();
        };
        html[open_end..end].trim().to_string()
    }

    fn find_ascii_ci(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window.eq_ignore_ascii_case(needle))
    }
}

#[async_trait]
impl WebTool for HttpWebTool {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, GatewayError> {
        let Some(endpoint) = &self.search_endpoint else {
            return Err(GatewayError::Config(
                "no search endpoint configured".to_string(),
            ));
        };

        let response = self
            .client
            .get(format!("{}/search", endpoint.trim_end_matches('/')))
            .query(&[("q", query), ("format", "json")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::Connection(format!(
                "search endpoint returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let body: Value = response.json().await?;
        let hits = body
            .get("results")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        Some(SearchHit {
                            title: row.get("title")?.as_str()?.to_string(),
                            url: row.get("url")?.as_str()?.to_string(),
                            snippet: row
                                .get("content")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(hits)
    }

    async fn fetch(&self, url: &str) -> Result<FetchResult, GatewayError> {
        url::Url::parse(url)
            .map_err(|e| GatewayError::Config(format!("invalid fetch url {}: {}", url, e)))?;

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::Connection(format!(
                "fetch returned HTTP {}",
                response.status().as_u16()
            )));
        }
        let html = response.text().await?;
        Ok(FetchResult {
            url: url.to_string(),
            title: Self::extract_title(&html),
            content: html,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct StubWebTool {
        fail_fetch: bool,
    }

    #[async_trait]
    impl WebTool for StubWebTool {
        async fn search(&self, _query: &str) -> Result<Vec<SearchHit>, GatewayError> {
            Ok(vec![SearchHit {
                title: "Result".into(),
                url: "https://example.com".into(),
                snippet: "snippet".into(),
            }])
        }

        async fn fetch(&self, url: &str) -> Result<FetchResult, GatewayError> {
            if self.fail_fetch {
                return Err(GatewayError::Connection("refused".into()));
            }
            Ok(FetchResult {
                url: url.to_string(),
                title: "Example Page".into(),
                content: "<h1>Header</h1>\n\nBody **bold** text".into(),
            })
        }
    }

    fn executor(limit: i64) -> ToolExecutor {
        ToolExecutor::new(Arc::new(StubWebTool { fail_fetch: false }), limit)
    }

    fn fetch_call(url: &str) -> ToolCallRequest {
        ToolCallRequest {
            name: "fetch_webpage".into(),
            arguments: json!({ "url": url }),
        }
    }

    #[tokio::test]
    async fn test_fetch_budget_returns_synthetic_result() {
        let exec = executor(2);
        for i in 0..2 {
            let out = exec.execute(&fetch_call(&format!("https://e.com/{}", i))).await;
            assert!(!out.contains("Fetch limit reached"), "call {} within budget", i);
        }

        let out = exec.execute(&fetch_call("https://e.com/3")).await;
        assert!(out.contains("Fetch limit reached (2 fetches)"));
        assert!(out.contains("synthesize"));
        assert_eq!(exec.fetches_used(), 2);
    }

    #[tokio::test]
    async fn test_unlimited_budget_never_synthesizes() {
        let exec = executor(-1);
        for i in 0..10 {
            let out = exec.execute(&fetch_call(&format!("https://e.com/{}", i))).await;
            assert!(!out.contains("Fetch limit reached"));
        }
        assert_eq!(exec.fetches_used(), 10);
    }

    #[tokio::test]
    async fn test_references_captured_and_deduped() {
        let exec = executor(-1);
        exec.execute(&fetch_call("https://example.com")).await;
        exec.execute(&fetch_call("https://example.com")).await;

        let refs = exec.references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].title, "Example Page");
        assert_eq!(refs[0].url, "https://example.com");
    }

    #[tokio::test]
    async fn test_fetch_failure_is_structured_not_fatal() {
        let exec = ToolExecutor::new(Arc::new(StubWebTool { fail_fetch: true }), 5);
        let out = exec.execute(&fetch_call("https://down.example.com")).await;
        assert!(out.contains("fetch failed"));
        assert!(exec.references().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported() {
        let exec = executor(5);
        let out = exec
            .execute(&ToolCallRequest {
                name: "rm_rf".into(),
                arguments: Value::Null,
            })
            .await;
        assert!(out.contains("unknown tool"));
    }

    #[test]
    fn test_content_stripper_removes_markup() {
        let stripper = ContentStripper;
        let out = stripper.strip("<h1>Title</h1>\n\n\n**bold** | cell\n---\ntext");
        assert!(!out.contains('<'));
        assert!(!out.contains("**"));
        assert!(!out.contains('|'));
        assert!(out.contains("bold"));
        assert!(out.contains("text"));
    }

    #[test]
    fn test_title_extraction() {
        let html = "<html><head><TITLE>My Page</TITLE></head></html>";
        assert_eq!(HttpWebTool::extract_title(html), "My Page");
        assert_eq!(HttpWebTool::extract_title("<p>no title</p>"), "");
    }

    #[test]
    fn test_tool_definitions_shape() {
        let defs = ToolExecutor::definitions();
        assert_eq!(defs.len(), 2);
        assert!(defs.iter().any(|d| d.name == "web_search"));
        assert!(defs.iter().any(|d| d.name == "fetch_webpage"));
    }
}

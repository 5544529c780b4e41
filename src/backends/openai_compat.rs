//! # OpenAI-Compatible Driver
//!
//! Driver for engines that expose `/v1/chat/completions` (SGLang, vLLM,
//! TRT-LLM). These servers host a fixed model set, so load is a readiness
//! probe and unload is a no-op; the orchestrator treats their models as
//! pre-loaded.

use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use super::{ChatOutcome, ChatRequest, ChunkStream, StreamEvent, ToolCallRequest};
use crate::capabilities::BackendKind;
use crate::error::GatewayError;

#[derive(Debug)]
pub struct OpenAiCompatBackend {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    base_url: String,
    kind: BackendKind,
}

impl OpenAiCompatBackend {
    pub fn new(
        client: reqwest::Client,
        stream_client: reqwest::Client,
        base_url: String,
        kind: BackendKind,
    ) -> Self {
        Self {
            client,
            stream_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            kind,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    fn chat_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "stream": stream,
        });
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome, GatewayError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&self.chat_body(request, false))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Generation(format!(
                "{} returned HTTP {}: {}",
                self.name(),
                status.as_u16(),
                text
            )));
        }

        let body: Value = serde_json::from_str(&text)?;
        let message = &body["choices"][0]["message"];

        let tool_calls = message
            .get("tool_calls")
            .and_then(Value::as_array)
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|call| {
                        let function = call.get("function")?;
                        let arguments = function
                            .get("arguments")
                            .and_then(Value::as_str)
                            .and_then(|raw| serde_json::from_str(raw).ok())
                            .unwrap_or(Value::Null);
                        Some(ToolCallRequest {
                            name: function.get("name")?.as_str()?.to_string(),
                            arguments,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ChatOutcome {
            content: message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tool_calls,
            eval_count: body["usage"]["completion_tokens"].as_u64(),
        })
    }

    /// Streaming via SSE: `data: {json}` lines, terminated by `data: [DONE]`.
    /// Tool-call argument deltas are accumulated per index and emitted as
    /// complete [`StreamEvent::ToolCall`]s at end of stream.
    pub async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, GatewayError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .json(&self.chat_body(request, true))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Generation(format!(
                "{} returned HTTP {}: {}",
                self.name(),
                status.as_u16(),
                text
            )));
        }

        let (tx, rx) = mpsc::channel::<Result<StreamEvent, GatewayError>>(64);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = BytesMut::new();
            let mut pending_tools = ToolCallAccumulator::default();
            let mut eval_count = None;

            'outer: while let Some(item) = bytes.next().await {
                match item {
                    Ok(chunk) => {
                        buffer.extend_from_slice(&chunk);
                        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                            let line = buffer.split_to(pos + 1);
                            let line = String::from_utf8_lossy(&line[..pos]);
                            let line = line.trim();

                            let Some(data) = line.strip_prefix("data:").map(str::trim) else {
                                continue;
                            };
                            if data == "[DONE]" {
                                break 'outer;
                            }

                            match Self::parse_sse_data(data, &mut pending_tools) {
                                SseFrame::Content(text) => {
                                    if tx.send(Ok(StreamEvent::Content(text))).await.is_err() {
                                        return;
                                    }
                                }
                                SseFrame::Usage(count) => eval_count = Some(count),
                                SseFrame::Ignored => {}
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(GatewayError::from(e))).await;
                        return;
                    }
                }
            }

            for call in pending_tools.finish() {
                if tx.send(Ok(StreamEvent::ToolCall(call))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(StreamEvent::Done { eval_count })).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn parse_sse_data(data: &str, tools: &mut ToolCallAccumulator) -> SseFrame {
        let Ok(frame) = serde_json::from_str::<Value>(data) else {
            debug!("skipping unparseable SSE frame: {}", data);
            return SseFrame::Ignored;
        };

        if let Some(count) = frame["usage"]["completion_tokens"].as_u64() {
            return SseFrame::Usage(count);
        }

        let delta = &frame["choices"][0]["delta"];
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                tools.accumulate(call);
            }
        }
        match delta.get("content").and_then(Value::as_str) {
            Some(text) if !text.is_empty() => SseFrame::Content(text.to_string()),
            _ => SseFrame::Ignored,
        }
    }

    /// Readiness probe; OpenAI-compatible servers pre-load their models.
    pub async fn warm_load(&self, timeout: Duration) -> Result<(), GatewayError> {
        let url = format!("{}/v1/models", self.base_url);
        let request = self.client.get(&url).send();
        let response = tokio::time::timeout(timeout, request).await.map_err(|_| {
            GatewayError::Connection(format!(
                "{} readiness probe timeout after {}s",
                self.name(),
                timeout.as_secs()
            ))
        })??;

        if !response.status().is_success() {
            return Err(GatewayError::Connection(format!(
                "{} readiness probe returned HTTP {}",
                self.name(),
                response.status().as_u16()
            )));
        }
        Ok(())
    }

    /// These engines own their model lifecycle; nothing to release.
    pub async fn unload(&self, model_id: &str) -> Result<(), GatewayError> {
        debug!(
            "⏭️  {} hosts {} permanently, skipping unload",
            self.name(),
            model_id
        );
        Ok(())
    }

    pub async fn list_loaded(&self) -> Result<HashSet<String>, GatewayError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::Connection(format!(
                "{} /v1/models returned HTTP {}",
                self.name(),
                response.status().as_u16()
            )));
        }
        let body: Value = response.json().await?;
        let loaded = body
            .get("data")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(loaded)
    }
}

enum SseFrame {
    Content(String),
    Usage(u64),
    Ignored,
}

/// Reassembles streamed tool-call deltas (`index` + name fragment + argument
/// string fragments) into complete calls.
#[derive(Default)]
struct ToolCallAccumulator {
    calls: BTreeMap<u64, (String, String)>,
}

impl ToolCallAccumulator {
    fn accumulate(&mut self, delta: &Value) {
        let index = delta.get("index").and_then(Value::as_u64).unwrap_or(0);
        let entry = self.calls.entry(index).or_default();
        if let Some(function) = delta.get("function") {
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                entry.0.push_str(name);
            }
            if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                entry.1.push_str(arguments);
            }
        }
    }

    fn finish(self) -> Vec<ToolCallRequest> {
        self.calls
            .into_values()
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, arguments)| ToolCallRequest {
                name,
                arguments: serde_json::from_str(&arguments).unwrap_or(Value::Null),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> OpenAiCompatBackend {
        OpenAiCompatBackend::new(
            reqwest::Client::new(),
            reqwest::Client::new(),
            "http://127.0.0.1:30000".to_string(),
            BackendKind::Sglang,
        )
    }

    #[test]
    fn test_name_follows_kind() {
        assert_eq!(backend().name(), "sglang");
    }

    #[test]
    fn test_sse_content_frame() {
        let mut tools = ToolCallAccumulator::default();
        let frame = OpenAiCompatBackend::parse_sse_data(
            r#"{"choices":[{"delta":{"content":"hi"}}]}"#,
            &mut tools,
        );
        assert!(matches!(frame, SseFrame::Content(c) if c == "hi"));
    }

    #[test]
    fn test_sse_usage_frame() {
        let mut tools = ToolCallAccumulator::default();
        let frame = OpenAiCompatBackend::parse_sse_data(
            r#"{"choices":[],"usage":{"completion_tokens":17}}"#,
            &mut tools,
        );
        assert!(matches!(frame, SseFrame::Usage(17)));
    }

    #[test]
    fn test_tool_call_accumulation_across_deltas() {
        let mut tools = ToolCallAccumulator::default();
        tools.accumulate(&serde_json::json!({
            "index": 0, "function": {"name": "fetch_webpage", "arguments": "{\"url\":"}
        }));
        tools.accumulate(&serde_json::json!({
            "index": 0, "function": {"arguments": "\"https://example.com\"}"}
        }));

        let calls = tools.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "fetch_webpage");
        assert_eq!(calls[0].arguments["url"], "https://example.com");
    }
}

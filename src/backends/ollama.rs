//! # Ollama Driver
//!
//! Talks Ollama's native API rather than its OpenAI-compat layer so the
//! backbone can use keep_alive for load/unload control, `/api/ps` for
//! reconciliation, and the `think` parameter for reasoning models.

use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::{ChatOutcome, ChatRequest, ChunkStream, StreamEvent, ToolCallRequest};
use crate::error::GatewayError;

#[derive(Debug)]
pub struct OllamaBackend {
    client: reqwest::Client,
    stream_client: reqwest::Client,
    base_url: String,
}

impl OllamaBackend {
    pub fn new(client: reqwest::Client, stream_client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            stream_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        "ollama"
    }

    fn chat_body(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": stream,
            "keep_alive": format!("{}s", request.keep_alive_seconds),
            "options": { "temperature": request.temperature },
        });
        if let Some(think) = &request.think {
            body["think"] = think.clone();
        }
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

    fn parse_tool_calls(message: &Value) -> Vec<ToolCallRequest> {
        let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
            return Vec::new();
        };
        calls
            .iter()
            .filter_map(|call| {
                let function = call.get("function")?;
                Some(ToolCallRequest {
                    name: function.get("name")?.as_str()?.to_string(),
                    arguments: function.get("arguments").cloned().unwrap_or(Value::Null),
                })
            })
            .collect()
    }

    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatOutcome, GatewayError> {
        let url = format!("{}/api/chat", self.base_url);
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
                "ollama returned HTTP {}: {}",
                status.as_u16(),
                text
            )));
        }

        let body: Value = serde_json::from_str(&text)?;
        let message = &body["message"];
        Ok(ChatOutcome {
            content: message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tool_calls: Self::parse_tool_calls(message),
            eval_count: body.get("eval_count").and_then(Value::as_u64),
        })
    }

    /// Start a streaming generation. NDJSON frames are parsed off the wire by
    /// a reader task and forwarded as [`StreamEvent`]s; backpressure from the
    /// consumer throttles the read naturally through the bounded channel.
    pub async fn stream_chat(&self, request: &ChatRequest) -> Result<ChunkStream, GatewayError> {
        let url = format!("{}/api/chat", self.base_url);
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
                "ollama returned HTTP {}: {}",
                status.as_u16(),
                text
            )));
        }

        let (tx, rx) = mpsc::channel::<Result<StreamEvent, GatewayError>>(64);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut buffer = BytesMut::new();

            while let Some(item) = bytes.next().await {
                match item {
                    Ok(chunk) => {
                        buffer.extend_from_slice(&chunk);
                        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                            let line = buffer.split_to(pos + 1);
                            let line = String::from_utf8_lossy(&line[..pos]);
                            if line.trim().is_empty() {
                                continue;
                            }
                            for event in Self::parse_stream_line(line.trim()) {
                                if tx.send(Ok(event)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(GatewayError::from(e))).await;
                        return;
                    }
                }
            }

            // Trailing frame without a newline terminator.
            if !buffer.is_empty() {
                let line = String::from_utf8_lossy(&buffer);
                for event in Self::parse_stream_line(line.trim()) {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn parse_stream_line(line: &str) -> Vec<StreamEvent> {
        let Ok(frame) = serde_json::from_str::<Value>(line) else {
            debug!("skipping unparseable ollama frame: {}", line);
            return Vec::new();
        };

        let mut events = Vec::new();
        if let Some(message) = frame.get("message") {
            if let Some(content) = message.get("content").and_then(Value::as_str) {
                if !content.is_empty() {
                    events.push(StreamEvent::Content(content.to_string()));
                }
            }
            for call in Self::parse_tool_calls(message) {
                events.push(StreamEvent::ToolCall(call));
            }
        }
        if frame.get("done").and_then(Value::as_bool) == Some(true) {
            events.push(StreamEvent::Done {
                eval_count: frame.get("eval_count").and_then(Value::as_u64),
            });
        }
        events
    }

    /// Warm the model into VRAM: an empty generate with the target keep_alive
    /// makes Ollama pull the weights without producing output.
    pub async fn warm_load(
        &self,
        model_id: &str,
        keep_alive_seconds: u64,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({
            "model": model_id,
            "keep_alive": format!("{}s", keep_alive_seconds),
        });

        let request = self.stream_client.post(&url).json(&body).send();
        let response = tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| {
                GatewayError::Connection(format!(
                    "model load timeout after {}s for {}",
                    timeout.as_secs(),
                    model_id
                ))
            })??;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Generation(format!(
                "ollama load returned HTTP {}: {}",
                status.as_u16(),
                text
            )));
        }
        Ok(())
    }

    /// keep_alive=0 asks Ollama to release the model immediately.
    pub async fn unload(&self, model_id: &str) -> Result<(), GatewayError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = json!({ "model": model_id, "keep_alive": 0 });

        let response = self.client.post(&url).json(&body).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!("ollama unload of {} returned HTTP {}", model_id, status);
            return Err(GatewayError::Generation(format!(
                "ollama unload returned HTTP {}: {}",
                status.as_u16(),
                text
            )));
        }
        Ok(())
    }

    /// Models currently resident according to `/api/ps`.
    pub async fn list_loaded(&self) -> Result<HashSet<String>, GatewayError> {
        let url = format!("{}/api/ps", self.base_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(GatewayError::Connection(format!(
                "ollama /api/ps returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let body: Value = response.json().await?;
        let loaded = body
            .get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(loaded)
    }
}

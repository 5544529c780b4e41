//! # Wire Frames
//!
//! JSON frames exchanged with connected clients, discriminated by a
//! mandatory `type` field. Inbound frames come from the chat bot or web UI;
//! outbound frames are produced by the fan-out and the per-client formatter.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::queue::AttachmentRef;
use crate::storage::Artifact;

/// Client → server frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Identify {
        client_id: String,
    },
    Message {
        user_id: String,
        conversation_id: String,
        message: String,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        channel_id: Option<String>,
        #[serde(default)]
        message_channel_id: Option<String>,
        #[serde(default)]
        attachments: Vec<AttachmentRef>,
        /// Per-request model override (web UI model selector).
        #[serde(default)]
        model: Option<String>,
    },
    Cancel {
        request_id: String,
    },
    Reset {
        conversation_id: String,
        user_id: String,
    },
    Close {
        conversation_id: String,
        user_id: String,
    },
    Configure {
        user_id: String,
        setting: String,
        #[serde(default)]
        value: Value,
    },
    Ping,
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Connected {
        client_id: String,
    },
    Queued {
        request_id: String,
        queue_position: usize,
        maintenance_mode: bool,
    },
    Processing {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    StreamChunk {
        request_id: String,
        content: String,
        is_complete: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_channel_id: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        artifacts: Vec<Artifact>,
        #[serde(skip_serializing_if = "std::ops::Not::not", default)]
        error: bool,
    },
    EarlyStatus {
        request_id: String,
        channel_id: String,
        content: String,
        status_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    /// Web UI terminal frame with generation metrics.
    Response {
        request_id: String,
        content: String,
        model: String,
        generation_time_seconds: f64,
        output_tokens: u64,
        reasoning_tokens: u64,
        tokens_per_second: f64,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        artifacts: Vec<Artifact>,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    Failed {
        request_id: String,
        error: String,
        attempts: u32,
    },
    Cancelled {
        request_id: String,
    },
    CancelFailed {
        request_id: String,
        reason: String,
    },
    MaintenanceWarning {
        message: String,
    },
    Pong,
    ResetComplete {
        conversation_id: String,
        deleted_count: usize,
    },
    CloseComplete {
        conversation_id: String,
        deleted_count: usize,
    },
    ConfigureResponse {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        setting: String,
    },
}

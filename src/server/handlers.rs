//! # HTTP and WebSocket Handlers
//!
//! The WebSocket endpoints carry the chat protocol (one per client kind);
//! the HTTP surface is liveness, metrics, and the internal VRAM/profile
//! admin API guarded by `X-Internal-API-Key`.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::AppState;
use crate::capabilities::ModelPriority;
use crate::queue::{ClientKind, QueuedRequest};
use crate::storage::estimate_tokens;
use crate::ws::{InboundFrame, OutboundFrame};

// =============================================================================
// HEALTH AND METRICS
// =============================================================================

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "queue_depth": state.queue.size(),
        "connected_clients": state.fanout.client_count(),
    }))
}

pub async fn metrics_snapshot(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.metrics.snapshot()).unwrap_or_default())
}

// =============================================================================
// INTERNAL ADMIN SURFACE
// =============================================================================

fn authorize_internal(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = &state.config.internal_api_key else {
        return Ok(());
    };
    let provided = headers
        .get("x-internal-api-key")
        .and_then(|value| value.to_str().ok());
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

pub async fn vram_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(code) = authorize_internal(&state, &headers) {
        return code.into_response();
    }
    match state.vram.get_status().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn vram_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(code) = authorize_internal(&state, &headers) {
        return code.into_response();
    }
    Json(state.vram.loaded_models().await).into_response()
}

pub async fn vram_available_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(code) = authorize_internal(&state, &headers) {
        return code.into_response();
    }
    let models: Vec<_> = state
        .capabilities
        .model_ids()
        .into_iter()
        .filter_map(|id| state.capabilities.get(&id).cloned())
        .collect();
    Json(json!({ "models": models })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ModelActionRequest {
    pub model_id: String,
}

pub async fn vram_load(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ModelActionRequest>,
) -> Response {
    if let Err(code) = authorize_internal(&state, &headers) {
        return code.into_response();
    }
    let already_loaded = state.vram.is_loaded(&body.model_id).await;
    if let Err(e) = state.vram.request_model_load(&body.model_id).await {
        return e.into_response();
    }

    // Admission only reserves the slot; an explicit admin load also warms
    // the backend, with the timeout scaled to model size.
    if !already_loaded {
        match state.capabilities.require(&body.model_id) {
            Ok(caps) if !caps.is_external => {
                let timeout = std::time::Duration::from_secs(
                    state
                        .config
                        .load_timeout_seconds
                        .max((caps.vram_size_gb * 6.0) as u64),
                );
                let driver = state.backends.driver(&caps.backend);
                if let Err(e) = driver
                    .warm_load(&body.model_id, caps.keep_alive_seconds, timeout)
                    .await
                {
                    state.vram.mark_model_unloaded(&body.model_id, true, None).await;
                    return e.into_response();
                }
            }
            Ok(_) => {}
            Err(e) => return e.into_response(),
        }
    }

    Json(json!({
        "status": if already_loaded { "already_loaded" } else { "loaded" },
        "model_id": body.model_id,
    }))
    .into_response()
}

pub async fn vram_unload(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ModelActionRequest>,
) -> Response {
    if let Err(code) = authorize_internal(&state, &headers) {
        return code.into_response();
    }
    state.vram.mark_model_unloaded(&body.model_id, false, None).await;
    Json(json!({ "status": "unloaded", "model_id": body.model_id })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct EvictRequest {
    pub priority: String,
}

pub async fn vram_evict(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EvictRequest>,
) -> Response {
    if let Err(code) = authorize_internal(&state, &headers) {
        return code.into_response();
    }
    let priority = ModelPriority::parse_or_normal(&body.priority);
    Json(state.vram.emergency_evict_lru(priority).await).into_response()
}

pub async fn vram_reconcile(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(code) = authorize_internal(&state, &headers) {
        return code.into_response();
    }
    match state.vram.reconcile_registry().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn vram_flush_cache(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(code) = authorize_internal(&state, &headers) {
        return code.into_response();
    }
    match state.vram.flush_buffer_cache().await {
        Ok(()) => Json(json!({ "status": "flushed" })).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn profile_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(code) = authorize_internal(&state, &headers) {
        return code.into_response();
    }
    let active = state.profiles.get_active_profile().await;
    Json(json!({
        "active": active.profile_name,
        "soft_limit_gb": active.soft_limit_gb,
        "hard_limit_gb": active.hard_limit_gb,
        "in_fallback": state.profiles.is_in_fallback().await,
        "known_profiles": state.profiles.known_profiles(),
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ProfileSwitchRequest {
    pub profile: String,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn profile_switch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ProfileSwitchRequest>,
) -> Response {
    if let Err(code) = authorize_internal(&state, &headers) {
        return code.into_response();
    }
    let reason = body.reason.as_deref().unwrap_or("manual switch");
    match state.profiles.switch_profile(&body.profile, reason).await {
        Ok(()) => Json(json!({ "status": "switched", "active": body.profile })).into_response(),
        Err(e) => e.into_response(),
    }
}

// =============================================================================
// WEBSOCKET ENDPOINTS
// =============================================================================

pub async fn ws_chat(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, ClientKind::Chat))
}

pub async fn ws_web(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, ClientKind::Web))
}

async fn handle_socket(socket: WebSocket, state: AppState, kind: ClientKind) {
    let (mut sink, mut stream) = socket.split();

    // The first frame must identify the client.
    let client_id = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<InboundFrame>(&text) {
                    Ok(InboundFrame::Identify { client_id }) if !client_id.is_empty() => {
                        break client_id
                    }
                    _ => {
                        warn!("first frame was not a valid identify, closing");
                        let _ = sink.close().await;
                        return;
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => return,
        }
    };
    info!("🔌 {:?} client connected: {}", kind, client_id);

    let mut outbound = state.fanout.register(&client_id);
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let json = serde_json::to_string(&frame).unwrap_or_default();
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    state
        .fanout
        .send_to_client(
            &client_id,
            OutboundFrame::Connected {
                client_id: client_id.clone(),
            },
        )
        .await;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<InboundFrame>(&text) {
                Ok(frame) => handle_frame(&state, &client_id, kind, frame).await,
                Err(e) => {
                    debug!("unparseable frame from {}: {}", client_id, e);
                    state
                        .fanout
                        .send_to_client(
                            &client_id,
                            OutboundFrame::Error {
                                error: format!("invalid frame: {}", e),
                                channel_id: None,
                                message_id: None,
                            },
                        )
                        .await;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("websocket error from {}: {}", client_id, e);
                break;
            }
        }
    }

    writer.abort();
    state.fanout.unregister(&client_id);
    info!("👋 {:?} client disconnected: {}", kind, client_id);
}

async fn handle_frame(state: &AppState, client_id: &str, kind: ClientKind, frame: InboundFrame) {
    match frame {
        InboundFrame::Identify { .. } => {
            // Already identified; re-identification is ignored.
        }
        InboundFrame::Message {
            user_id,
            conversation_id,
            message,
            message_id,
            channel_id,
            message_channel_id,
            attachments,
            model,
        } => {
            handle_message_frame(
                state,
                client_id,
                kind,
                MessageFields {
                    user_id,
                    conversation_id,
                    message,
                    message_id,
                    channel_id,
                    message_channel_id,
                    attachments,
                    model,
                },
            )
            .await
        }
        InboundFrame::Cancel { request_id } => {
            let cancelled = state.queue.cancel(&request_id);
            let frame = if cancelled {
                OutboundFrame::Cancelled { request_id }
            } else {
                OutboundFrame::CancelFailed {
                    request_id,
                    reason: "Request already processing".to_string(),
                }
            };
            state.fanout.send_to_client(client_id, frame).await;
        }
        InboundFrame::Reset {
            conversation_id, ..
        } => {
            let deleted = state
                .conversations
                .delete_conversation(&conversation_id)
                .await
                .unwrap_or(0);
            info!("🔄 Reset conversation {}: {} messages", conversation_id, deleted);
            state
                .fanout
                .send_to_client(
                    client_id,
                    OutboundFrame::ResetComplete {
                        conversation_id,
                        deleted_count: deleted,
                    },
                )
                .await;
        }
        InboundFrame::Close {
            conversation_id, ..
        } => {
            let deleted = state
                .conversations
                .delete_conversation(&conversation_id)
                .await
                .unwrap_or(0);
            info!("🗑️  Closed conversation {}: {} messages", conversation_id, deleted);
            state
                .fanout
                .send_to_client(
                    client_id,
                    OutboundFrame::CloseComplete {
                        conversation_id,
                        deleted_count: deleted,
                    },
                )
                .await;
        }
        InboundFrame::Configure {
            user_id,
            setting,
            value,
        } => handle_configure_frame(state, client_id, &user_id, &setting, value).await,
        InboundFrame::Ping => {
            state
                .fanout
                .send_to_client(client_id, OutboundFrame::Pong)
                .await;
        }
    }
}

struct MessageFields {
    user_id: String,
    conversation_id: String,
    message: String,
    message_id: Option<String>,
    channel_id: Option<String>,
    message_channel_id: Option<String>,
    attachments: Vec<crate::queue::AttachmentRef>,
    model: Option<String>,
}

async fn handle_message_frame(
    state: &AppState,
    client_id: &str,
    kind: ClientKind,
    fields: MessageFields,
) {
    info!(
        "📨 Message from user {}: {:.80}",
        fields.user_id, fields.message
    );

    if state.config.maintenance_mode_hard {
        state
            .fanout
            .send_to_client(
                client_id,
                OutboundFrame::Error {
                    error: state.config.maintenance_message_hard.clone(),
                    channel_id: fields.channel_id,
                    message_id: fields.message_id,
                },
            )
            .await;
        return;
    }

    if state.queue.is_full() {
        state
            .fanout
            .send_to_client(
                client_id,
                OutboundFrame::Error {
                    error: "Queue is full. Please try again in a few minutes.".to_string(),
                    channel_id: fields.channel_id,
                    message_id: fields.message_id,
                },
            )
            .await;
        return;
    }

    // Early indicator while attachment content is folded in, so chat users
    // see typing dots before classification even starts.
    if !fields.attachments.is_empty() {
        if let Some(channel_id) = &fields.channel_id {
            state
                .fanout
                .send_status(
                    client_id,
                    channel_id,
                    fields.message_id.as_deref(),
                    "processing_files",
                    "pending",
                )
                .await;
        }
    }

    if let Err(e) = state
        .users
        .ensure_user(&fields.user_id, state.config.default_token_budget)
        .await
    {
        warn!("user bootstrap failed: {}", e);
    }

    let mut token_basis = fields.message.clone();
    for attachment in &fields.attachments {
        token_basis.push_str(&attachment.extracted_content);
    }
    let estimated_tokens = estimate_tokens(&token_basis);

    let request = QueuedRequest {
        request_id: String::new(),
        user_id: fields.user_id,
        conversation_id: fields.conversation_id,
        message: fields.message,
        message_id: fields.message_id.clone(),
        channel_id: fields.channel_id.clone(),
        message_channel_id: fields.message_channel_id,
        client_id: client_id.to_string(),
        client_kind: kind,
        attachments: fields.attachments,
        estimated_tokens,
        attempt: 0,
        enqueued_at: chrono::Utc::now(),
        model_override: fields.model,
        cancel: CancellationToken::new(),
    };

    match state.queue.enqueue(request) {
        Ok(request_id) => {
            let queue_position = state.queue.get_position(&request_id).unwrap_or(1);
            state
                .fanout
                .send_to_client(
                    client_id,
                    OutboundFrame::Queued {
                        request_id,
                        queue_position,
                        maintenance_mode: state.config.maintenance_mode,
                    },
                )
                .await;

            if state.config.maintenance_mode {
                state
                    .fanout
                    .send_to_client(
                        client_id,
                        OutboundFrame::MaintenanceWarning {
                            message: state.config.maintenance_message.clone(),
                        },
                    )
                    .await;
            }
        }
        Err(e) => {
            state
                .fanout
                .send_to_client(
                    client_id,
                    OutboundFrame::Error {
                        error: e.to_string(),
                        channel_id: fields.channel_id,
                        message_id: fields.message_id,
                    },
                )
                .await;
        }
    }
}

async fn handle_configure_frame(
    state: &AppState,
    client_id: &str,
    user_id: &str,
    setting: &str,
    value: Value,
) {
    if let Err(e) = state
        .users
        .ensure_user(user_id, state.config.default_token_budget)
        .await
    {
        warn!("user bootstrap failed: {}", e);
    }

    let result: Result<String, String> = match setting {
        "temperature" => {
            let temperature = value.as_f64().map(|t| t as f32);
            match temperature {
                Some(t) if !(0.0..=2.0).contains(&t) => {
                    Err("Temperature must be between 0.0 and 2.0".to_string())
                }
                _ => state
                    .users
                    .set_temperature(user_id, temperature)
                    .await
                    .map(|()| match temperature {
                        Some(t) => format!("Temperature set to {}", t),
                        None => "Temperature reset to default".to_string(),
                    })
                    .map_err(|e| e.to_string()),
            }
        }
        "thinking" => state
            .users
            .set_thinking(user_id, value.as_bool())
            .await
            .map(|()| match value.as_bool() {
                Some(true) => "Thinking mode forced on".to_string(),
                Some(false) => "Thinking mode forced off".to_string(),
                None => "Thinking mode set to auto".to_string(),
            })
            .map_err(|e| e.to_string()),
        "model" => {
            let model = value.as_str().map(str::to_string);
            match &model {
                Some(model_id) if !state.capabilities.contains(model_id) => Err(format!(
                    "Model '{}' not available. Choose from: {}",
                    model_id,
                    state.capabilities.model_ids().join(", ")
                )),
                _ => state
                    .users
                    .set_preferred_model(user_id, model.clone())
                    .await
                    .map(|()| match model {
                        Some(m) => format!("Preferred model set to {}", m),
                        None => "Preferred model reset to system recommendation".to_string(),
                    })
                    .map_err(|e| e.to_string()),
            }
        }
        "reset" => state
            .users
            .reset_preferences(user_id)
            .await
            .map(|()| "All preferences reset to system defaults".to_string())
            .map_err(|e| e.to_string()),
        other => Err(format!("Unknown setting: {}", other)),
    };

    let frame = match result {
        Ok(message) => {
            info!("⚙️  Updated {} for user {}", setting, user_id);
            OutboundFrame::ConfigureResponse {
                success: true,
                message: Some(message),
                error: None,
                setting: setting.to_string(),
            }
        }
        Err(error) => OutboundFrame::ConfigureResponse {
            success: false,
            message: None,
            error: Some(error),
            setting: setting.to_string(),
        },
    };
    state.fanout.send_to_client(client_id, frame).await;
}

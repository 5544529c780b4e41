//! # WebSocket Fan-out
//!
//! Keyed registry of connected clients. Each connection owns an mpsc
//! send-half here and a writer task on the socket side; components address
//! clients purely by id and never touch sockets. Frame translation per
//! client kind lives in [`formatters`].

pub mod formatters;
pub mod messages;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use formatters::{MessageFormatter, RateLimitBackoff};
pub use messages::{InboundFrame, OutboundFrame};

/// Per-client outbound buffer; a full buffer signals a slow consumer.
pub const CLIENT_BUFFER: usize = 256;

#[derive(Debug)]
pub struct WsFanout {
    clients: DashMap<String, mpsc::Sender<OutboundFrame>>,
}

impl WsFanout {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    /// Register a client connection, returning the receive half the
    /// connection's writer task drains. Reconnecting under the same id
    /// replaces the previous registration.
    pub fn register(&self, client_id: &str) -> mpsc::Receiver<OutboundFrame> {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        if self.clients.insert(client_id.to_string(), tx).is_some() {
            info!("🔁 Client {} reconnected, replacing registration", client_id);
        } else {
            info!("🔌 Client {} registered", client_id);
        }
        rx
    }

    pub fn unregister(&self, client_id: &str) {
        if self.clients.remove(client_id).is_some() {
            info!("👋 Client {} unregistered", client_id);
        }
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Deliver a frame to one client. Returns false when the client is gone
    /// or its connection has stopped draining; callers treat that as a dead
    /// connection, not an error to retry.
    pub async fn send_to_client(&self, client_id: &str, frame: OutboundFrame) -> bool {
        let Some(sender) = self.clients.get(client_id).map(|entry| entry.value().clone()) else {
            debug!("no such client {}", client_id);
            return false;
        };

        match sender.send(frame).await {
            Ok(()) => true,
            Err(_) => {
                warn!("⚠️  Client {} channel closed, dropping registration", client_id);
                self.unregister(client_id);
                false
            }
        }
    }

    /// Early status indicator (e.g. while attachments are processed) that
    /// chat clients render as animated typing dots.
    pub async fn send_status(
        &self,
        client_id: &str,
        channel_id: &str,
        message_id: Option<&str>,
        status_type: &str,
        request_id: &str,
    ) -> bool {
        self.send_to_client(
            client_id,
            OutboundFrame::EarlyStatus {
                request_id: request_id.to_string(),
                channel_id: channel_id.to_string(),
                content: status_text(status_type).to_string(),
                status_type: status_type.to_string(),
                message_id: message_id.map(str::to_string),
            },
        )
        .await
    }
}

impl Default for WsFanout {
    fn default() -> Self {
        Self::new()
    }
}

fn status_text(status_type: &str) -> &'static str {
    match status_type {
        "processing_files" => "*Processing files...*",
        "thinking" => "*Thinking...*",
        "queued" => "*Queued...*",
        _ => "*Working...*",
    }
}

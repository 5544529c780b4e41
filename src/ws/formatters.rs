//! # Message Formatters
//!
//! Per-client-kind translation of stream progress into wire frames. The two
//! surfaces differ only in envelope and delta policy:
//!
//! - **Chat**: the bot edits a single message, so every update carries the
//!   full accumulated content plus the ids needed for reaction updates.
//! - **Web**: the UI appends, so updates carry only the delta since the last
//!   send, and completion is a `response` frame with generation metrics.
//!
//! Both throttle chunk emission to a minimum interval; the chat side also
//! stretches its interval exponentially when the transport reports rate
//! limiting.

use std::time::{Duration, Instant};

use super::messages::OutboundFrame;
use crate::orchestrator::ProcessOutcome;
use crate::queue::{ClientKind, QueuedRequest};

/// Exponential backoff for rate-limited transports. A server-supplied
/// retry-after hint takes precedence over the computed delay.
#[derive(Debug, Clone)]
pub struct RateLimitBackoff {
    base: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl RateLimitBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: None,
        }
    }

    /// Record a rate-limited send.
    pub fn note_limited(&mut self, retry_after: Option<Duration>) {
        let next = match (retry_after, self.current) {
            (Some(hint), _) => hint,
            (None, Some(current)) => current.saturating_mul(2),
            (None, None) => self.base,
        };
        self.current = Some(next.min(self.max));
    }

    /// Record a successful send; backoff decays fully.
    pub fn note_success(&mut self) {
        self.current = None;
    }

    /// Extra delay to add on top of the regular chunk interval.
    pub fn delay(&self) -> Duration {
        self.current.unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug)]
pub struct ChatFormatter {
    interval: Duration,
    last_sent: Option<Instant>,
    backoff: RateLimitBackoff,
}

#[derive(Debug)]
pub struct WebFormatter {
    interval: Duration,
    last_sent: Option<Instant>,
    last_sent_length: usize,
}

/// Formatter sum type, chosen per request at admission.
#[derive(Debug)]
pub enum MessageFormatter {
    Chat(ChatFormatter),
    Web(WebFormatter),
}

impl MessageFormatter {
    pub fn for_request(
        request: &QueuedRequest,
        chat_interval: Duration,
        web_interval: Duration,
    ) -> Self {
        match request.client_kind {
            ClientKind::Chat => Self::Chat(ChatFormatter {
                interval: chat_interval,
                last_sent: None,
                backoff: RateLimitBackoff::new(Duration::from_secs(1), Duration::from_secs(30)),
            }),
            ClientKind::Web => Self::Web(WebFormatter {
                interval: web_interval,
                last_sent: None,
                last_sent_length: 0,
            }),
        }
    }

    pub fn processing(&self, request: &QueuedRequest) -> OutboundFrame {
        OutboundFrame::Processing {
            request_id: request.request_id.clone(),
            channel_id: request.channel_id.clone(),
            message_id: request.message_id.clone(),
        }
    }

    /// Throttled incremental update for accumulated content. Returns `None`
    /// while inside the minimum interval, or (web only) when there is no new
    /// content to send.
    pub fn stream_update(
        &mut self,
        request: &QueuedRequest,
        full_content: &str,
    ) -> Option<OutboundFrame> {
        match self {
            Self::Chat(chat) => {
                let interval = chat.interval + chat.backoff.delay();
                if !due(&mut chat.last_sent, interval) {
                    return None;
                }
                Some(chunk_frame(request, full_content.to_string(), false))
            }
            Self::Web(web) => {
                if full_content.len() <= web.last_sent_length {
                    return None;
                }
                if !due(&mut web.last_sent, web.interval) {
                    return None;
                }
                let delta = full_content[web.last_sent_length..].to_string();
                web.last_sent_length = full_content.len();
                Some(chunk_frame(request, delta, false))
            }
        }
    }

    /// Unthrottled status line pushed between retry attempts.
    pub fn status_chunk(&self, request: &QueuedRequest, text: &str) -> OutboundFrame {
        chunk_frame(request, text.to_string(), false)
    }

    /// Terminal frame carrying the final content, artifacts, and metrics.
    pub fn completion(&mut self, request: &QueuedRequest, outcome: &ProcessOutcome) -> OutboundFrame {
        match self {
            Self::Chat(_) => OutboundFrame::StreamChunk {
                request_id: request.request_id.clone(),
                content: outcome.response.clone(),
                is_complete: true,
                channel_id: request.channel_id.clone(),
                message_id: request.message_id.clone(),
                message_channel_id: request.message_channel_id.clone(),
                artifacts: outcome.artifacts.clone(),
                error: false,
            },
            Self::Web(web) => {
                web.last_sent_length = outcome.response.len();
                OutboundFrame::Response {
                    request_id: request.request_id.clone(),
                    content: outcome.response.clone(),
                    model: outcome.model.clone(),
                    generation_time_seconds: outcome.generation_time.as_secs_f64(),
                    output_tokens: outcome.output_tokens,
                    reasoning_tokens: outcome.thinking_tokens,
                    tokens_per_second: outcome.tokens_per_second(),
                    artifacts: outcome.artifacts.clone(),
                }
            }
        }
    }

    /// Terminal error chunk: chat clients replace the edited message, web
    /// clients receive a plain error frame.
    pub fn terminal_error(&self, request: &QueuedRequest, message: &str) -> OutboundFrame {
        match self {
            Self::Chat(_) => OutboundFrame::StreamChunk {
                request_id: request.request_id.clone(),
                content: message.to_string(),
                is_complete: true,
                channel_id: request.channel_id.clone(),
                message_id: request.message_id.clone(),
                message_channel_id: request.message_channel_id.clone(),
                artifacts: Vec::new(),
                error: true,
            },
            Self::Web(_) => OutboundFrame::Error {
                error: message.to_string(),
                channel_id: request.channel_id.clone(),
                message_id: request.message_id.clone(),
            },
        }
    }

    pub fn failed(&self, request: &QueuedRequest, error: &str, attempts: u32) -> OutboundFrame {
        OutboundFrame::Failed {
            request_id: request.request_id.clone(),
            error: error.to_string(),
            attempts,
        }
    }

    /// Transport reported rate limiting (chat only).
    pub fn note_rate_limited(&mut self, retry_after: Option<Duration>) {
        if let Self::Chat(chat) = self {
            chat.backoff.note_limited(retry_after);
        }
    }

    pub fn note_delivered(&mut self) {
        if let Self::Chat(chat) = self {
            chat.backoff.note_success();
        }
    }
}

fn chunk_frame(request: &QueuedRequest, content: String, is_complete: bool) -> OutboundFrame {
    OutboundFrame::StreamChunk {
        request_id: request.request_id.clone(),
        content,
        is_complete,
        channel_id: request.channel_id.clone(),
        message_id: request.message_id.clone(),
        message_channel_id: request.message_channel_id.clone(),
        artifacts: Vec::new(),
        error: false,
    }
}

/// Check-and-arm interval gate.
fn due(last_sent: &mut Option<Instant>, interval: Duration) -> bool {
    let now = Instant::now();
    match last_sent {
        Some(last) if now.duration_since(*last) < interval => false,
        _ => {
            *last_sent = Some(now);
            true
        }
    }
}

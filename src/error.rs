//! # Error Taxonomy
//!
//! Crate-wide error type covering every failure surface of the serving
//! backbone, with conversions from transport/serialization errors and an
//! HTTP mapping for the admin surface. Each variant has a distinct wire
//! representation so clients can react without string matching.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, Clone)]
pub enum GatewayError {
    /// Model id missing from the capability registry, or a profile references
    /// a model that does not exist. Not retried.
    Config(String),
    /// Admission denied: the request queue is at capacity.
    QueueFull { max_size: usize },
    /// The user is over their token quota. Not retried.
    TokenBudgetExceeded { remaining: i64 },
    /// The orchestrator could not make room even after eviction.
    Memory(String),
    /// Too many recent crashes for this model; load refused.
    CircuitBreakerOpen {
        model_id: String,
        retry_after_seconds: u64,
    },
    /// Backend I/O failure (connect, refused, timeout, unreachable).
    Connection(String),
    /// Streaming completed but produced no non-whitespace content.
    EmptyStream { model_id: String },
    /// The backend returned a structured failure during generation.
    Generation(String),
    /// The request was cancelled before processing.
    Cancelled { request_id: String },
    Serialization(String),
    Internal(String),
}

impl GatewayError {
    /// Short machine-readable code used in wire payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::QueueFull { .. } => "queue_full",
            Self::TokenBudgetExceeded { .. } => "token_budget_exceeded",
            Self::Memory(_) => "memory_error",
            Self::CircuitBreakerOpen { .. } => "circuit_breaker_open",
            Self::Connection(_) => "connection_error",
            Self::EmptyStream { .. } => "empty_stream",
            Self::Generation(_) => "generation_error",
            Self::Cancelled { .. } => "cancelled",
            Self::Serialization(_) => "serialization_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether this error is connection-class: the crash tracker records it
    /// and the worker may retry after a profile switch. Matches the same
    /// keyword set against wrapped backend messages, so a `Generation` error
    /// whose cause was a refused connect is classified uniformly.
    pub fn is_connection_class(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Generation(msg) | Self::Internal(msg) => {
                let lower = msg.to_lowercase();
                ["connection", "connect", "refused", "timeout", "unreachable"]
                    .iter()
                    .any(|kw| lower.contains(kw))
            }
            _ => false,
        }
    }

    /// Whether the queue worker may requeue a request that failed with this
    /// error. Configuration and quota problems will fail identically on
    /// every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Config(_)
                | Self::TokenBudgetExceeded { .. }
                | Self::Cancelled { .. }
                | Self::QueueFull { .. }
        )
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::QueueFull { max_size } => write!(
                f,
                "Queue is full ({} requests). Please try again in a few minutes.",
                max_size
            ),
            Self::TokenBudgetExceeded { remaining } => {
                write!(f, "Token budget exceeded. Remaining: {}", remaining)
            }
            Self::Memory(msg) => write!(f, "Memory error: {}", msg),
            Self::CircuitBreakerOpen {
                model_id,
                retry_after_seconds,
            } => write!(
                f,
                "Circuit breaker open for {}: too many recent crashes, retry in {}s",
                model_id, retry_after_seconds
            ),
            Self::Connection(msg) => write!(f, "Connection error: {}", msg),
            Self::EmptyStream { model_id } => {
                write!(f, "Streaming returned empty response from {}", model_id)
            }
            Self::Generation(msg) => write!(f, "Generation failed: {}", msg),
            Self::Cancelled { request_id } => write!(f, "Request {} cancelled", request_id),
            Self::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Connection("request timeout - backend did not respond in time".to_string())
        } else if err.is_connect() {
            GatewayError::Connection("connection failed - unable to reach backend".to_string())
        } else if let Some(status) = err.status() {
            GatewayError::Generation(format!("HTTP {}: {}", status.as_u16(), err))
        } else {
            GatewayError::Connection(format!("HTTP client error: {}", err))
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => {
                GatewayError::Connection("I/O operation timed out".to_string())
            }
            _ => GatewayError::Internal(format!("I/O error: {}", err)),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::TokenBudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::Memory(_) => StatusCode::INSUFFICIENT_STORAGE,
            Self::CircuitBreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Connection(_) => StatusCode::BAD_GATEWAY,
            Self::EmptyStream { .. } | Self::Generation(_) => StatusCode::BAD_GATEWAY,
            Self::Cancelled { .. } => StatusCode::CONFLICT,
            Self::Serialization(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.code(),
            }
        });
        if let Self::CircuitBreakerOpen {
            retry_after_seconds, ..
        } = &self
        {
            body["error"]["retry_after_seconds"] = json!(retry_after_seconds);
        }

        (status, Json(body)).into_response()
    }
}

//! # Server Module
//!
//! Route table and middleware for the public WebSocket surface and the
//! internal admin API.

pub mod handlers;
pub mod state;

pub use state::{AppState, Collaborators};

use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    trace::{self, TraceLayer},
};
use tracing::Level;

/// Create router with all routes and middleware
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Client transports, one endpoint per client kind
        .route("/ws/chat", get(handlers::ws_chat))
        .route("/ws/web", get(handlers::ws_web))
        // Liveness and metrics
        .route("/health", get(handlers::health_check))
        .route("/v1/metrics", get(handlers::metrics_snapshot))
        // Internal VRAM admin API
        .route("/internal/vram/status", get(handlers::vram_status))
        .route("/internal/vram/models", get(handlers::vram_models))
        .route(
            "/internal/vram/available-models",
            get(handlers::vram_available_models),
        )
        .route("/internal/vram/load", post(handlers::vram_load))
        .route("/internal/vram/unload", post(handlers::vram_unload))
        .route("/internal/vram/evict", post(handlers::vram_evict))
        .route("/internal/vram/reconcile", post(handlers::vram_reconcile))
        .route("/internal/vram/flush-cache", post(handlers::vram_flush_cache))
        // Profile inspection and manual switching
        .route(
            "/internal/profile",
            get(handlers::profile_get).post(handlers::profile_switch),
        )
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                        .on_response(trace::DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

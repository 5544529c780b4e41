//! # ModelMux - LLM Serving Backbone
//!
//! ModelMux fronts a fleet of locally hosted LLMs with a conversational chat
//! surface while multiplexing scarce GPU memory across mutually exclusive
//! model backends. Four tightly coupled mechanisms make up the core:
//!
//! - **Admission and queueing**: a bounded FIFO with per-request lifecycle,
//!   retries, and cancellation.
//! - **Routing**: a small router LLM classifies each turn; explicit user
//!   model choices bypass classification.
//! - **VRAM orchestration**: a global scheduler loads/unloads models under
//!   hard and soft budgets with priority-bounded LRU eviction and a
//!   crash-based circuit breaker that can fall back to a conservative
//!   profile.
//! - **Streaming execution**: a backpressure-aware pipeline that drives
//!   generation, strips reasoning tokens, enforces per-route tool budgets,
//!   and fans chunks out over WebSocket to heterogeneous clients.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use modelmux::{create_router, AppState, Collaborators, Config, ModelsDocument};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::parse_args();
//!     let document = ModelsDocument::from_path(&config.models_path)?;
//!     let collaborators = Collaborators::defaults(&config);
//!     let (state, _alerts) = AppState::new(config, document, collaborators)?;
//!
//!     let app = create_router(state);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`config`] - runtime settings plus the TOML models document
//! - [`capabilities`] - static model capability registry
//! - [`profiles`] - VRAM profiles, fallback switching, breaker supervisor
//! - [`vram`] - the VRAM orchestrator and its components
//! - [`backends`] - backend sum type (Ollama, SGLang, vLLM, TRT-LLM)
//! - [`queue`] / [`worker`] - admission FIFO and the scheduler loop
//! - [`router`] / [`preferences`] - route classification and preference
//!   resolution
//! - [`agent`] - streaming agent runner, filters, prompts, tools
//! - [`orchestrator`] - per-request conductor
//! - [`ws`] - WebSocket fan-out and per-client formatters
//! - [`server`] - axum routes and application state

// Core infrastructure
pub mod capabilities;
pub mod config;
pub mod core;
pub mod error;
pub mod graceful_shutdown;
pub mod metrics;
pub mod storage;

// Domain modules
pub mod agent;
pub mod backends;
pub mod orchestrator;
pub mod preferences;
pub mod profiles;
pub mod queue;
pub mod router;
pub mod vram;
pub mod worker;
pub mod ws;

// Server surface
pub mod server;

// Re-export commonly used types for convenience
pub use capabilities::{BackendKind, CapabilityRegistry, ModelCapability, ModelPriority};
pub use config::{Config, ModelsDocument};
pub use error::GatewayError;
pub use graceful_shutdown::{GracefulShutdown, ShutdownConfig};
pub use metrics::{GatewayMetrics, MetricsCollector};
pub use orchestrator::{ProcessOutcome, RequestOrchestrator};
pub use profiles::{Profile, ProfileManager};
pub use queue::{ClientKind, QueuedRequest, RequestQueue};
pub use router::{RouteConfig, RouteKind, RouterService};
pub use server::{create_router, AppState, Collaborators};
pub use vram::{StatusSnapshot, VramOrchestrator};
pub use worker::{QueueWorker, WorkerSettings};
pub use ws::{MessageFormatter, WsFanout};

/// The result type used throughout the library
pub type Result<T> = std::result::Result<T, GatewayError>;

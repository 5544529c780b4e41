//! # ModelMux Server
//!
//! Process root: construct the singletons, spawn the background tasks
//! (queue worker, breaker supervisor, reconciler, pressure watchdog), and
//! serve the WebSocket/admin surface until a shutdown signal arrives.

use std::time::Duration;

use modelmux::graceful_shutdown::{GracefulShutdown, ShutdownConfig};
use modelmux::worker::{QueueWorker, WorkerSettings};
use modelmux::{create_router, AppState, Collaborators, Config, ModelsDocument};

use modelmux::capabilities::ModelPriority;
use std::net::SocketAddr;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::parse_args();
    let document = ModelsDocument::from_path(&config.models_path)?;
    let collaborators = Collaborators::defaults(&config);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let (state, alerts) = AppState::new(config, document, collaborators)?;

    info!("🚀 ModelMux starting on http://{}", addr);
    info!(
        "Profile: {} | models: {} | queue capacity: {}",
        state.config.active_profile,
        state.capabilities.len(),
        state.config.max_queue_size
    );

    // Circuit breaker supervisor: crash alerts → profile fallback.
    let supervisor = state.profiles.clone().spawn_breaker_supervisor(alerts);

    // Periodic registry reconciliation against backend reality.
    if state.config.reconcile_interval_seconds > 0 {
        let vram = state.vram.clone();
        let interval = Duration::from_secs(state.config.reconcile_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = vram.reconcile_registry().await {
                    warn!("reconciliation failed: {}", e);
                }
            }
        });
    }

    // Memory pressure watchdog: sustained PSI triggers an emergency evict.
    if state.config.pressure_check_interval_seconds > 0 {
        let vram = state.vram.clone();
        let threshold = state.config.pressure_some_threshold;
        let interval = Duration::from_secs(state.config.pressure_check_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match vram.get_status().await {
                    Ok(status) if status.memory.psi_some_avg10 > threshold => {
                        warn!(
                            "🚨 Memory pressure {:.1} over threshold {:.1}",
                            status.memory.psi_some_avg10, threshold
                        );
                        let outcome = vram.emergency_evict_lru(ModelPriority::Normal).await;
                        if outcome.evicted {
                            info!(
                                "✅ Pressure eviction freed {:.1}GB ({})",
                                outcome.size_gb,
                                outcome.model_id.unwrap_or_default()
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("pressure sample failed: {}", e),
                }
            }
        });
    }

    let shutdown = GracefulShutdown::new(ShutdownConfig::default());

    let worker = QueueWorker::new(
        state.queue.clone(),
        state.orchestrator.clone(),
        state.profiles.clone(),
        state.vram.clone(),
        state.fanout.clone(),
        state.metrics.clone(),
        WorkerSettings {
            enable_streaming: state.config.enable_streaming,
            chat_chunk_interval: Duration::from_millis(state.config.stream_chunk_interval_ms),
            web_chunk_interval: Duration::from_millis(state.config.web_stream_chunk_interval_ms),
            empty_stream_retries: state.config.empty_stream_retries,
        },
        shutdown.token(),
    )
    .spawn();

    let _metrics_reporter = state.metrics.start_reporting(60);

    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signal_shutdown.wait_for_signal().await {
            error!("signal handling error: {}", e);
        }
    });

    let server_shutdown = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.token().cancelled().await });
    if let Err(e) = server.await {
        error!("server error: {}", e);
    }

    shutdown.drain(&state.queue, worker).await;
    supervisor.abort();
    info!("✅ ModelMux stopped");
    Ok(())
}

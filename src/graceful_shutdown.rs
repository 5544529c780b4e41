//! # Graceful Shutdown
//!
//! Signal-driven shutdown for the server process: stop admitting work, let
//! the queue worker finish its in-flight request, then exit. Clients left in
//! the queue receive nothing further; the bounded drain timeout keeps a
//! wedged generation from blocking exit forever.

use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::queue::RequestQueue;

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long to wait for in-flight work to finish.
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
pub struct GracefulShutdown {
    token: CancellationToken,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            token: CancellationToken::new(),
            config,
        }
    }

    /// Token observed by the worker loop and the axum server.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn initiate(&self) {
        info!("🛑 Graceful shutdown initiated");
        self.token.cancel();
    }

    /// Block until SIGINT/SIGTERM/SIGQUIT, then cancel the shutdown token.
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigquit = signal::unix::signal(signal::unix::SignalKind::quit())?;
            tokio::select! {
                _ = signal::ctrl_c() => info!("📡 Received SIGINT"),
                _ = sigterm.recv() => info!("📡 Received SIGTERM"),
                _ = sigquit.recv() => info!("📡 Received SIGQUIT"),
            }
        }
        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("📡 Received Ctrl+C");
        }

        self.initiate();
        Ok(())
    }

    /// Wait for the worker to finish its current request, bounded by the
    /// drain timeout.
    pub async fn drain(
        &self,
        queue: &RequestQueue,
        worker: tokio::task::JoinHandle<()>,
    ) {
        let pending = queue.size();
        if pending > 0 {
            warn!("⚠️  Shutting down with {} request(s) still queued", pending);
        }

        match tokio::time::timeout(self.config.drain_timeout, worker).await {
            Ok(_) => info!("✅ Worker drained cleanly"),
            Err(_) => warn!(
                "⚠️  Worker did not drain within {:?}, exiting anyway",
                self.config.drain_timeout
            ),
        }
    }
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new(ShutdownConfig::default())
    }
}

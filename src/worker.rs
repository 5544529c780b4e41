//! # Queue Worker
//!
//! The scheduler loop: pops admitted requests and conducts them through the
//! orchestrator, translating stream progress into client frames via the
//! per-request formatter. Owns the two recovery ladders that live above the
//! orchestrator:
//!
//! - empty streams retry in non-streaming mode (reusing the route config to
//!   skip re-classification), up to a fixed attempt count;
//! - connection-class failures wait briefly for the circuit breaker, and if
//!   a profile fallback happened, retry the stream once with fresh routing.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::GatewayError;
use crate::metrics::MetricsCollector;
use crate::orchestrator::{ProcessOutcome, RequestOrchestrator};
use crate::profiles::ProfileManager;
use crate::queue::{QueuedRequest, RequestQueue};
use crate::router::RouteKind;
use crate::vram::VramOrchestrator;
use crate::ws::{MessageFormatter, WsFanout};

/// Idle poll interval when the queue is empty.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Grace period for the breaker supervisor to complete a profile switch
/// after a connection-class failure.
const BREAKER_SETTLE: Duration = Duration::from_millis(1500);

pub struct WorkerSettings {
    pub enable_streaming: bool,
    pub chat_chunk_interval: Duration,
    pub web_chunk_interval: Duration,
    pub empty_stream_retries: u32,
}

pub struct QueueWorker {
    queue: Arc<RequestQueue>,
    orchestrator: Arc<RequestOrchestrator>,
    profiles: Arc<ProfileManager>,
    vram: Arc<VramOrchestrator>,
    fanout: Arc<WsFanout>,
    metrics: Arc<MetricsCollector>,
    settings: WorkerSettings,
    shutdown: CancellationToken,
}

impl QueueWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<RequestQueue>,
        orchestrator: Arc<RequestOrchestrator>,
        profiles: Arc<ProfileManager>,
        vram: Arc<VramOrchestrator>,
        fanout: Arc<WsFanout>,
        metrics: Arc<MetricsCollector>,
        settings: WorkerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            profiles,
            vram,
            fanout,
            metrics,
            settings,
            shutdown,
        }
    }

    /// Spawn the worker loop. A single logical worker keeps orchestrator
    /// admission sequential per model.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        info!("🚀 Queue worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.queue.dequeue() {
                Some(request) => {
                    if let Err(e) = self.process_request(request).await {
                        error!("worker error: {}", e);
                    }
                }
                None => tokio::time::sleep(IDLE_POLL).await,
            }
        }
        info!("🛑 Queue worker stopped (depth {})", self.queue.size());
    }

    async fn process_request(&self, request: QueuedRequest) -> Result<(), GatewayError> {
        if request.cancel.is_cancelled() {
            self.queue.mark_complete(&request.request_id);
            self.fanout
                .send_to_client(
                    &request.client_id,
                    crate::ws::OutboundFrame::Cancelled {
                        request_id: request.request_id.clone(),
                    },
                )
                .await;
            return Ok(());
        }

        self.metrics.record_request();
        let mut formatter = MessageFormatter::for_request(
            &request,
            self.settings.chat_chunk_interval,
            self.settings.web_chunk_interval,
        );

        self.fanout
            .send_to_client(&request.client_id, formatter.processing(&request))
            .await;

        let result = if self.settings.enable_streaming {
            debug!("📡 Processing {} with streaming", request.request_id);
            self.process_with_streaming(&request, &mut formatter).await
        } else {
            debug!("📡 Processing {} without streaming", request.request_id);
            match self.orchestrator.process(&request, None).await {
                Ok(outcome) => {
                    let frame = formatter.completion(&request, &outcome);
                    self.fanout.send_to_client(&request.client_id, frame).await;
                    Ok(outcome)
                }
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(outcome) => {
                self.queue.mark_complete(&outcome.request_id);
                self.metrics.record_success(
                    outcome.tokens_used,
                    outcome.generation_time.as_millis() as u64,
                );
                // Unload happens after transmission is complete, never while
                // chunks are still queued for the client.
                self.conservative_unload(&outcome).await;
            }
            Err(e) => {
                error!("❌ Request {} failed: {}", request.request_id, e);
                self.metrics.record_failure();
                let requeued = self.queue.mark_failed(&request.request_id, &e);
                if !requeued {
                    let frame = formatter.failed(&request, &e.to_string(), request.attempt + 1);
                    self.fanout.send_to_client(&request.client_id, frame).await;
                }
            }
        }
        Ok(())
    }

    /// Conservative profiles reclaim the router immediately after a
    /// SELF_HANDLE turn instead of trusting keep_alive; high-VRAM profiles
    /// leave it resident for the next classification.
    async fn conservative_unload(&self, outcome: &ProcessOutcome) {
        if outcome.route_config.route != RouteKind::SelfHandle {
            return;
        }
        let profile = self.profiles.get_active_profile().await;
        if outcome.model != profile.roles.router {
            return;
        }
        if profile.conservative_mode {
            debug!("🔽 Conservative mode: unloading router after SELF_HANDLE");
            self.vram.mark_model_unloaded(&outcome.model, false, None).await;
        } else {
            debug!(
                "💤 {} profile: router stays loaded (keep_alive)",
                profile.profile_name
            );
        }
    }

    /// Drive one streaming pass: forward accumulated-content updates to the
    /// client while the orchestrator runs. Returns the outcome plus whether
    /// the client connection died mid-stream.
    async fn stream_once(
        &self,
        request: &QueuedRequest,
        formatter: &mut MessageFormatter,
    ) -> (Result<ProcessOutcome, GatewayError>, bool) {
        let (tx, mut rx) = mpsc::channel::<String>(32);
        let process = self.orchestrator.process_stream(request, tx);
        tokio::pin!(process);

        let mut connection_dead = false;
        let mut outcome = None;
        loop {
            tokio::select! {
                result = &mut process, if outcome.is_none() => {
                    outcome = Some(result);
                }
                update = rx.recv() => {
                    let Some(content) = update else { break };
                    if connection_dead {
                        continue;
                    }
                    if let Some(frame) = formatter.stream_update(request, &content) {
                        if self.fanout.send_to_client(&request.client_id, frame).await {
                            formatter.note_delivered();
                        } else {
                            warn!(
                                "⚠️  Client {} gone mid-stream for {}",
                                request.client_id, request.request_id
                            );
                            connection_dead = true;
                        }
                    }
                }
            }
        }

        let result = match outcome {
            Some(result) => result,
            None => process.await,
        };
        (result, connection_dead)
    }

    async fn process_with_streaming(
        &self,
        request: &QueuedRequest,
        formatter: &mut MessageFormatter,
    ) -> Result<ProcessOutcome, GatewayError> {
        let (result, connection_dead) = self.stream_once(request, formatter).await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                return self
                    .handle_stream_failure(request, formatter, e)
                    .await
            }
        };

        // The backend kept generating for a client nobody is reading; there
        // is no compensating unload, keep-alive reclaims the model later.
        if connection_dead {
            return Err(GatewayError::Internal(format!(
                "client {} disconnected during streaming",
                request.client_id
            )));
        }

        if !outcome.response.trim().is_empty() {
            let frame = formatter.completion(request, &outcome);
            self.fanout.send_to_client(&request.client_id, frame).await;
            return Ok(outcome);
        }

        self.retry_empty_stream(request, formatter, outcome).await
    }

    /// Empty stream: retry in non-streaming mode, reusing the route config
    /// from the streaming attempt to save the classification round-trip.
    async fn retry_empty_stream(
        &self,
        request: &QueuedRequest,
        formatter: &mut MessageFormatter,
        empty_outcome: ProcessOutcome,
    ) -> Result<ProcessOutcome, GatewayError> {
        warn!(
            "⚠️  Streaming returned empty response for {}, retrying non-streaming",
            request.request_id
        );
        let max_retries = self.settings.empty_stream_retries;
        let route_config = empty_outcome.route_config.clone();

        for attempt in 1..=max_retries {
            let status = format!(
                "*Retrying with non-streaming mode (attempt {}/{})...*\n\n",
                attempt, max_retries
            );
            let frame = formatter.status_chunk(request, &status);
            self.fanout.send_to_client(&request.client_id, frame).await;

            match self
                .orchestrator
                .process(request, Some(route_config.clone()))
                .await
            {
                Ok(outcome) if !outcome.response.trim().is_empty() => {
                    info!(
                        "✅ Non-streaming retry {} succeeded: {} chars",
                        attempt,
                        outcome.response.len()
                    );
                    let frame = formatter.completion(request, &outcome);
                    self.fanout.send_to_client(&request.client_id, frame).await;
                    return Ok(outcome);
                }
                Ok(_) => warn!("⚠️  Retry attempt {} returned empty response", attempt),
                Err(e) => error!("❌ Non-streaming retry attempt {} failed: {}", attempt, e),
            }
        }

        error!(
            "❌ All {} retry attempts failed for {}",
            max_retries, request.request_id
        );
        let message = format!("Unable to generate response (tried {} times)", max_retries);
        let frame = formatter.terminal_error(request, &message);
        self.fanout.send_to_client(&request.client_id, frame).await;
        // The client already received its terminal frame; resolve the
        // request rather than requeueing a turn the user watched fail.
        Ok(empty_outcome)
    }

    /// Connection-class failures may mean the circuit breaker is mid-switch:
    /// give it a moment, and if the profile fell back, retry once with fresh
    /// routing against the fallback role map.
    async fn handle_stream_failure(
        &self,
        request: &QueuedRequest,
        formatter: &mut MessageFormatter,
        error: GatewayError,
    ) -> Result<ProcessOutcome, GatewayError> {
        error!("❌ Streaming failed for {}: {}", request.request_id, error);

        if error.is_connection_class() {
            info!("🔄 Connection-class error, waiting for circuit breaker...");
            tokio::time::sleep(BREAKER_SETTLE).await;

            if self.profiles.is_in_fallback().await {
                info!("✅ Profile fell back mid-request, retrying with fresh routing");
                let status = "*Falling back to alternative model...*\n\n";
                let frame = formatter.status_chunk(request, status);
                self.fanout.send_to_client(&request.client_id, frame).await;

                let (result, connection_dead) = self.stream_once(request, formatter).await;
                match result {
                    Ok(outcome) if !connection_dead => {
                        info!("✅ Circuit breaker retry completed {}", request.request_id);
                        let frame = formatter.completion(request, &outcome);
                        self.fanout.send_to_client(&request.client_id, frame).await;
                        return Ok(outcome);
                    }
                    Ok(_) => {
                        return Err(GatewayError::Internal(format!(
                            "client {} disconnected during fallback retry",
                            request.client_id
                        )))
                    }
                    Err(retry_error) => {
                        error!("❌ Circuit breaker retry failed: {}", retry_error);
                    }
                }
            }
        }

        let frame =
            formatter.terminal_error(request, &format!("Generation interrupted: {}", error));
        self.fanout.send_to_client(&request.client_id, frame).await;
        Err(error)
    }
}

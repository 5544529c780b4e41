//! # Metrics Collection Module
//!
//! Atomic counters aggregated into a snapshot for the `/v1/metrics` endpoint
//! and periodic log reporting: request counts, token throughput, and
//! generation latency.

use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::time::interval;
use tracing::info;

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_tokens: u64,
    pub avg_generation_time_ms: f64,
    pub requests_per_second: f64,
    pub tokens_per_second: f64,
    pub error_rate: f64,
}

#[derive(Debug)]
pub struct MetricsCollector {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    tokens: AtomicU64,
    generation_time_ms: AtomicU64,
    generation_count: AtomicUsize,
    started: Instant,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            tokens: AtomicU64::new(0),
            generation_time_ms: AtomicU64::new(0),
            generation_count: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, tokens: u64, generation_time_ms: u64) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
        self.generation_time_ms
            .fetch_add(generation_time_ms, Ordering::Relaxed);
        self.generation_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GatewayMetrics {
        let total_requests = self.requests.load(Ordering::Relaxed);
        let successful_requests = self.successes.load(Ordering::Relaxed);
        let failed_requests = self.failures.load(Ordering::Relaxed);
        let total_tokens = self.tokens.load(Ordering::Relaxed);
        let generation_time_sum = self.generation_time_ms.load(Ordering::Relaxed);
        let generation_count = self.generation_count.load(Ordering::Relaxed);

        let avg_generation_time_ms = if generation_count > 0 {
            generation_time_sum as f64 / generation_count as f64
        } else {
            0.0
        };

        let elapsed = self.started.elapsed().as_secs_f64();
        let (requests_per_second, tokens_per_second) = if elapsed > 0.0 {
            (
                total_requests as f64 / elapsed,
                total_tokens as f64 / elapsed,
            )
        } else {
            (0.0, 0.0)
        };

        let error_rate = if total_requests > 0 {
            failed_requests as f64 / total_requests as f64
        } else {
            0.0
        };

        GatewayMetrics {
            total_requests,
            successful_requests,
            failed_requests,
            total_tokens,
            avg_generation_time_ms,
            requests_per_second,
            tokens_per_second,
            error_rate,
        }
    }

    /// Periodic metrics log line.
    pub fn start_reporting(self: &Arc<Self>, interval_seconds: u64) -> tokio::task::JoinHandle<()> {
        let collector = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_seconds));
            loop {
                ticker.tick().await;
                let m = collector.snapshot();
                info!(
                    "Metrics: requests={}, success={}, failed={}, tokens={}, avg_time={:.2}ms, rps={:.2}, tps={:.2}, error_rate={:.2}%",
                    m.total_requests,
                    m.successful_requests,
                    m.failed_requests,
                    m.total_tokens,
                    m.avg_generation_time_ms,
                    m.requests_per_second,
                    m.tokens_per_second,
                    m.error_rate * 100.0
                );
            }
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = MetricsCollector::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_success(100, 250);
        metrics.record_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.total_tokens, 100);
        assert_eq!(snapshot.avg_generation_time_ms, 250.0);
        assert_eq!(snapshot.error_rate, 0.5);
    }

    #[test]
    fn test_empty_snapshot_has_no_nans() {
        let snapshot = MetricsCollector::new().snapshot();
        assert_eq!(snapshot.avg_generation_time_ms, 0.0);
        assert_eq!(snapshot.error_rate, 0.0);
        assert!(snapshot.requests_per_second.is_finite());
    }
}

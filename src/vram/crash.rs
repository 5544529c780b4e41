//! # Crash Tracker
//!
//! Time-windowed crash accounting per model, feeding the circuit breaker.
//! Records are appended on crash and trimmed as they age out of the window.
//! When a model's in-window count reaches the threshold, an alert is pushed
//! to the breaker supervisor over a channel; the supervisor decides whether a
//! profile switch is warranted.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CrashRecord {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Alert emitted when a model crosses the crash threshold.
#[derive(Debug, Clone)]
pub struct CrashAlert {
    pub model_id: String,
    pub crash_count: usize,
    pub reason: String,
}

/// Crash statistics for one model within the current window.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CrashStats {
    pub model_id: String,
    pub crash_count: usize,
    pub last_crash_seconds_ago: u64,
}

#[derive(Debug)]
struct TrackerState {
    crashes: HashMap<String, VecDeque<CrashRecord>>,
}

#[derive(Debug)]
pub struct CrashTracker {
    state: Mutex<TrackerState>,
    window: ChronoDuration,
    threshold: usize,
    alerts: mpsc::UnboundedSender<CrashAlert>,
}

impl CrashTracker {
    /// Build a tracker plus the receiving end of its alert channel.
    pub fn new(
        window_seconds: u64,
        threshold: usize,
    ) -> (Self, mpsc::UnboundedReceiver<CrashAlert>) {
        let (alerts, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Mutex::new(TrackerState {
                    crashes: HashMap::new(),
                }),
                window: ChronoDuration::seconds(window_seconds as i64),
                threshold,
                alerts,
            },
            rx,
        )
    }

    pub fn window_seconds(&self) -> u64 {
        self.window.num_seconds().max(0) as u64
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record a crash event. Fires a [`CrashAlert`] once the in-window count
    /// reaches the threshold.
    pub fn record_crash(&self, model_id: &str, reason: &str) {
        let now = Utc::now();
        let count = {
            let mut state = self.state.lock().expect("crash tracker poisoned");
            let records = state.crashes.entry(model_id.to_string()).or_default();
            records.push_back(CrashRecord {
                timestamp: now,
                reason: reason.to_string(),
            });
            Self::trim(records, now, self.window);
            records.len()
        };

        warn!(
            "⚠️  Recorded crash for {} (reason: {}, {} in window)",
            model_id, reason, count
        );

        if count >= self.threshold {
            let alert = CrashAlert {
                model_id: model_id.to_string(),
                crash_count: count,
                reason: reason.to_string(),
            };
            if self.alerts.send(alert).is_err() {
                debug!("crash alert receiver dropped");
            }
        }
    }

    /// In-window crash count for a model.
    pub fn crash_count(&self, model_id: &str) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock().expect("crash tracker poisoned");
        match state.crashes.get_mut(model_id) {
            Some(records) => {
                Self::trim(records, now, self.window);
                records.len()
            }
            None => 0,
        }
    }

    /// Whether the breaker should refuse/protect loads of this model.
    pub fn needs_protection(&self, model_id: &str) -> bool {
        self.crash_count(model_id) >= self.threshold
    }

    /// Seconds until the oldest in-window crash ages out; the suggested wait
    /// attached to CircuitBreaker errors.
    pub fn suggested_wait_seconds(&self, model_id: &str) -> u64 {
        let now = Utc::now();
        let mut state = self.state.lock().expect("crash tracker poisoned");
        let Some(records) = state.crashes.get_mut(model_id) else {
            return 0;
        };
        Self::trim(records, now, self.window);
        match records.front() {
            Some(oldest) => {
                let age = now - oldest.timestamp;
                (self.window - age).num_seconds().max(0) as u64
            }
            None => 0,
        }
    }

    /// Stats for every model with at least one in-window crash.
    pub fn all_stats(&self) -> Vec<CrashStats> {
        let now = Utc::now();
        let mut state = self.state.lock().expect("crash tracker poisoned");
        let mut stats = Vec::new();
        for (model_id, records) in state.crashes.iter_mut() {
            Self::trim(records, now, self.window);
            if let Some(last) = records.back() {
                stats.push(CrashStats {
                    model_id: model_id.clone(),
                    crash_count: records.len(),
                    last_crash_seconds_ago: (now - last.timestamp).num_seconds().max(0) as u64,
                });
            }
        }
        stats.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        stats
    }

    fn trim(records: &mut VecDeque<CrashRecord>, now: DateTime<Utc>, window: ChronoDuration) {
        while let Some(front) = records.front() {
            if now - front.timestamp > window {
                records.pop_front();
            } else {
                break;
            }
        }
    }
}

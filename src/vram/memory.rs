//! # Memory Monitor
//!
//! Samples host memory state and PSI pressure, and performs the OS-level
//! buffer cache flush large model loads depend on. The trait seam exists so
//! orchestrator tests can pin memory readings without touching /proc.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::GatewayError;

/// A point-in-time memory sample.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStatus {
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    /// Aggregate VRAM attributed to tracked models; filled in by the caller
    /// from the registry, not by the monitor.
    pub model_usage_gb: f64,
    pub pressure_some_avg10: f64,
    pub pressure_full_avg10: f64,
}

#[async_trait]
pub trait MemoryMonitor: Send + Sync {
    /// Sample current memory state.
    async fn status(&self) -> Result<MemoryStatus, GatewayError>;

    /// Best-effort OS buffer cache flush (`sync` + drop_caches). Failure is
    /// logged by callers, never fatal.
    async fn flush_cache(&self) -> Result<(), GatewayError>;
}

/// /proc-backed monitor for Linux hosts. On non-Linux targets (or when PSI
/// accounting is unavailable) the pressure fields read as zero.
#[derive(Debug, Default)]
pub struct SystemMemoryMonitor;

impl SystemMemoryMonitor {
    pub fn new() -> Self {
        Self
    }

    fn parse_meminfo(raw: &str) -> (f64, f64) {
        let mut total_kb = 0.0;
        let mut available_kb = 0.0;
        for line in raw.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                total_kb = Self::leading_number(rest);
            } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
                available_kb = Self::leading_number(rest);
            }
        }
        (total_kb / 1024.0 / 1024.0, available_kb / 1024.0 / 1024.0)
    }

    /// Parse `some avg10=1.23 ...` / `full avg10=0.45 ...` lines from
    /// /proc/pressure/memory.
    fn parse_pressure(raw: &str) -> (f64, f64) {
        let mut some_avg10 = 0.0;
        let mut full_avg10 = 0.0;
        for line in raw.lines() {
            let target = if line.starts_with("some") {
                &mut some_avg10
            } else if line.starts_with("full") {
                &mut full_avg10
            } else {
                continue;
            };
            if let Some(value) = line
                .split_whitespace()
                .find_map(|field| field.strip_prefix("avg10="))
            {
                *target = value.parse().unwrap_or(0.0);
            }
        }
        (some_avg10, full_avg10)
    }

    fn leading_number(text: &str) -> f64 {
        text.split_whitespace()
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl MemoryMonitor for SystemMemoryMonitor {
    async fn status(&self) -> Result<MemoryStatus, GatewayError> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .unwrap_or_default();
        let (total_gb, available_gb) = Self::parse_meminfo(&meminfo);

        let pressure = tokio::fs::read_to_string("/proc/pressure/memory")
            .await
            .unwrap_or_default();
        let (pressure_some_avg10, pressure_full_avg10) = Self::parse_pressure(&pressure);

        Ok(MemoryStatus {
            total_gb,
            used_gb: (total_gb - available_gb).max(0.0),
            available_gb,
            model_usage_gb: 0.0,
            pressure_some_avg10,
            pressure_full_avg10,
        })
    }

    async fn flush_cache(&self) -> Result<(), GatewayError> {
        // sync first so dirty pages are not lost when the page cache drops.
        let sync_status = tokio::process::Command::new("sync").status().await;
        if let Err(e) = sync_status {
            warn!("sync before cache flush failed: {}", e);
        }

        match tokio::fs::write("/proc/sys/vm/drop_caches", "3\n").await {
            Ok(()) => {
                debug!("💾 Dropped OS buffer caches");
                Ok(())
            }
            Err(e) => {
                warn!("⚠️  Buffer cache flush unavailable: {}", e);
                Ok(())
            }
        }
    }
}

/// Monitor with pinned readings. Used by tests and by deployments that
/// disable host sampling.
#[derive(Debug, Clone, Default)]
pub struct FixedMemoryMonitor {
    status: MemoryStatus,
}

impl FixedMemoryMonitor {
    pub fn new(status: MemoryStatus) -> Self {
        Self { status }
    }

    pub fn with_available_gb(available_gb: f64) -> Self {
        Self {
            status: MemoryStatus {
                total_gb: 128.0,
                used_gb: 128.0 - available_gb,
                available_gb,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl MemoryMonitor for FixedMemoryMonitor {
    async fn status(&self) -> Result<MemoryStatus, GatewayError> {
        Ok(self.status.clone())
    }

    async fn flush_cache(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}

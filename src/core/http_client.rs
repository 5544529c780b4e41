//! # HTTP Client Factory
//!
//! Centralized reqwest client creation so every component that talks to a
//! backend or fetches a page shares consistent pool and timeout settings.
//! Streaming clients deliberately omit the request-level timeout: a
//! generation can legitimately run for minutes while chunks keep flowing.

use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

/// HTTP client configuration errors
#[derive(Debug, Error)]
pub enum HttpClientError {
    #[error("Failed to build HTTP client: {0}")]
    BuildError(#[from] reqwest::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
    pub keepalive: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
            keepalive: Some(Duration::from_secs(60)),
        }
    }
}

/// Full client configuration.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout; `None` for streaming clients.
    pub timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub pool: PoolConfig,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
            pool: PoolConfig::default(),
        }
    }
}

/// Builder with purpose-specific presets.
pub struct HttpClientBuilder {
    config: HttpClientConfig,
}

impl HttpClientBuilder {
    pub fn new() -> Self {
        Self {
            config: HttpClientConfig::default(),
        }
    }

    /// Client for long-lived NDJSON/SSE generation streams: no request
    /// timeout, but still bounded connect time.
    pub fn streaming() -> Self {
        Self {
            config: HttpClientConfig {
                timeout: None,
                connect_timeout: Duration::from_secs(10),
                pool: PoolConfig::default(),
            },
        }
    }

    /// Short-deadline client for page fetches driven by tool calls.
    pub fn fetch(timeout: Duration) -> Self {
        Self {
            config: HttpClientConfig {
                timeout: Some(timeout),
                connect_timeout: Duration::from_secs(5),
                pool: PoolConfig {
                    max_idle_per_host: 4,
                    idle_timeout: Duration::from_secs(30),
                    keepalive: None,
                },
            },
        }
    }

    /// Set request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Set connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set pool configuration
    pub fn pool_config(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    /// Build the HTTP client
    pub fn build(self) -> Result<Client, HttpClientError> {
        let mut builder = Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .pool_max_idle_per_host(self.config.pool.max_idle_per_host)
            .pool_idle_timeout(self.config.pool.idle_timeout);

        if let Some(timeout) = self.config.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(keepalive) = self.config.pool.keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }

        builder.build().map_err(HttpClientError::from)
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

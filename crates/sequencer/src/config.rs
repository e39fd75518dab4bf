//! Allocator and database configuration

use sea_orm::ConnectOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AllocatorError, Result};

/// Retry, backoff and timeout budget for one `allocate_and_create` call
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Write attempts before giving up with `AllocationExhausted`
    pub max_attempts: u32,
    /// First backoff step, doubled on each further conflict
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Upper bound of the random jitter added to every backoff step
    #[serde(with = "duration_ms", rename = "max_jitter_ms")]
    pub max_jitter: Duration,
    /// Cap on the exponential part of a backoff step
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Applied to every individual storage call
    #[serde(with = "duration_ms", rename = "call_timeout_ms")]
    pub call_timeout: Duration,
    /// Wall-clock ceiling for the whole retry loop
    #[serde(with = "duration_ms", rename = "deadline_ms")]
    pub deadline: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_jitter: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
            call_timeout: Duration::from_secs(5),
            deadline: Duration::from_secs(10),
        }
    }
}

impl AllocatorConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_jitter: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_jitter = max_jitter;
        self.max_delay = max_delay;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AllocatorError::InvalidConfig(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(AllocatorError::InvalidConfig(
                "call_timeout must be greater than zero".to_string(),
            ));
        }
        if self.deadline.is_zero() {
            return Err(AllocatorError::InvalidConfig(
                "deadline must be greater than zero".to_string(),
            ));
        }
        if self.max_delay > self.deadline || self.max_jitter > self.deadline {
            return Err(AllocatorError::InvalidConfig(format!(
                "max_delay ({:?}) and max_jitter ({:?}) must not exceed deadline ({:?})",
                self.max_delay, self.max_jitter, self.deadline
            )));
        }
        Ok(())
    }
}

/// Connection pool settings for `SqlStore`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout: Duration,
    pub acquire_timeout: Duration,
    /// `None` keeps idle connections open (required for in-memory SQLite)
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    pub sqlx_logging: bool,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let mut config = Self {
            url,
            max_connections: 100,
            min_connections: 10,
            connect_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(60),
            idle_timeout: Some(Duration::from_secs(300)),
            max_lifetime: Some(Duration::from_secs(3600)),
            connect_attempts: 3,
            connect_retry_delay: Duration::from_secs(2),
            sqlx_logging: true,
        };

        // Every pooled connection to `sqlite::memory:` would see its own empty database
        if config.is_in_memory_sqlite() {
            config.max_connections = 1;
            config.min_connections = 1;
            config.idle_timeout = None;
            config.max_lifetime = None;
            config.sqlx_logging = false;
        }
        config
    }

    pub fn is_in_memory_sqlite(&self) -> bool {
        self.url.starts_with("sqlite:") && self.url.contains(":memory:")
    }

    pub fn connect_options(&self) -> ConnectOptions {
        let mut opt = ConnectOptions::new(self.url.clone());
        opt.max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .connect_timeout(self.connect_timeout)
            .acquire_timeout(self.acquire_timeout)
            .sqlx_logging(self.sqlx_logging)
            .sqlx_slow_statements_logging_settings(
                tracing::log::LevelFilter::Warn,
                Duration::from_millis(500),
            );
        if let Some(idle) = self.idle_timeout {
            opt.idle_timeout(idle);
        }
        if let Some(lifetime) = self.max_lifetime {
            opt.max_lifetime(lifetime);
        }
        opt
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

//! Bounded exponential backoff with random jitter for the allocation retry loop

use rand::{rng, Rng};
use std::time::{Duration, Instant};

use crate::config::AllocatorConfig;

/// Delay before retry number `retry` (0-based): `base * 2^retry`, capped, plus jitter
pub(crate) fn delay_for_retry(config: &AllocatorConfig, retry: u32) -> Duration {
    let exponential = config
        .base_delay
        .saturating_mul(1u32 << retry.min(16))
        .min(config.max_delay);

    let jitter_ms = u64::try_from(config.max_jitter.as_millis()).unwrap_or(u64::MAX);
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rng().random_range(0..=jitter_ms)
    };

    exponential.saturating_add(Duration::from_millis(jitter))
}

/// Tracks attempts and elapsed time against an `AllocatorConfig` budget
pub(crate) struct Backoff<'a> {
    config: &'a AllocatorConfig,
    attempts: u32,
    started: Instant,
}

impl<'a> Backoff<'a> {
    pub(crate) fn new(config: &'a AllocatorConfig) -> Self {
        Self {
            config,
            attempts: 0,
            started: Instant::now(),
        }
    }

    /// Record the start of an attempt and return its 1-based number
    pub(crate) fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Sleep before the next attempt. Returns `false` without sleeping once either the
    /// attempt budget or the deadline would be exceeded.
    pub(crate) async fn pause(&self) -> bool {
        if self.attempts >= self.config.max_attempts {
            return false;
        }
        let delay = delay_for_retry(self.config, self.attempts.saturating_sub(1));
        if self.elapsed().saturating_add(delay) >= self.config.deadline {
            return false;
        }
        tokio::time::sleep(delay).await;
        true
    }
}

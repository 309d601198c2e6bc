//! Rate limiting seam.
//!
//! The token endpoint consults a [`RateLimiter`] before doing any work. The
//! limiter only counts; the policy (limit, fail-open) lives in [`allow`].

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::RateLimitConfig;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit backend unavailable: {0}")]
    Backend(String),
}

#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one hit for `key` in the current window and return the total.
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, RateLimitError>;
}

#[derive(Debug, Clone)]
struct WindowEntry {
    count: u64,
    window_start: Instant,
}

/// Fixed-window counter kept in process memory.
#[derive(Clone, Default)]
pub struct InMemoryRateLimiter {
    store: Arc<DashMap<String, WindowEntry>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries whose window ended more than one window ago.
    pub fn cleanup(&self, window: Duration) {
        let now = Instant::now();
        self.store
            .retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }
}

#[async_trait::async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn increment(&self, key: &str, window: Duration) -> Result<u64, RateLimitError> {
        let now = Instant::now();
        let mut entry = self
            .store
            .entry(key.to_string())
            .or_insert_with(|| WindowEntry {
                count: 0,
                window_start: now,
            });
        if now.duration_since(entry.window_start) >= window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count += 1;
        Ok(entry.count)
    }
}

/// Whether a request keyed by `key` may proceed. Backend failures let the
/// request through.
pub async fn allow(limiter: &dyn RateLimiter, config: &RateLimitConfig, key: &str) -> bool {
    if !config.enabled {
        return true;
    }
    match limiter
        .increment(key, Duration::from_secs(config.window_secs))
        .await
    {
        Ok(count) => count <= config.max_requests,
        Err(e) => {
            tracing::warn!(error = %e, "Rate limiter unavailable, allowing request");
            true
        }
    }
}

//! Per-user order-submission rate limiting.
//!
//! A `DashMap`-backed sliding window with a periodic cleanup task evicting
//! expired entries, targeted at per-user order submission rather than
//! per-IP HTTP throttling — the Gateway is the only caller that needs this,
//! so there is no axum middleware layer here, just the counting primitive.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::error::CoreError;

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    /// 30 requests per 60-second window.
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
        }
    }
}

struct Entry {
    count: u32,
    window_start: Instant,
}

/// Sliding-window limiter keyed by user id. Cheaply clonable; every clone
/// shares the same counters.
#[derive(Clone)]
pub struct RateLimiter {
    entries: Arc<DashMap<String, Entry>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let entries: Arc<DashMap<String, Entry>> = Arc::new(DashMap::new());
        let cleanup_entries = entries.clone();
        let window = config.window;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(window * 2);
            loop {
                interval.tick().await;
                let now = Instant::now();
                cleanup_entries.retain(|_, entry| now.duration_since(entry.window_start) < window);
            }
        });
        Self { entries, config }
    }

    /// `Err(RateLimited)` if `user` has exceeded `max_requests` in the
    /// current window; otherwise records this call and allows it.
    pub fn check(&self, user: &str) -> Result<(), CoreError> {
        let now = Instant::now();
        let mut entry = self.entries.entry(user.to_string()).or_insert_with(|| Entry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;
        if entry.count > self.config.max_requests {
            return Err(CoreError::RateLimited);
        }
        Ok(())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_requests_within_the_window_budget() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 3,
            window: Duration::from_secs(60),
        });
        for _ in 0..3 {
            limiter.check("alice").unwrap();
        }
        assert!(matches!(limiter.check("alice"), Err(CoreError::RateLimited)));
    }

    #[tokio::test]
    async fn tracks_each_user_independently() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
        });
        limiter.check("alice").unwrap();
        assert!(limiter.check("alice").is_err());
        limiter.check("bob").unwrap();
    }

    #[tokio::test]
    async fn resets_after_the_window_elapses() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_millis(20),
        });
        limiter.check("alice").unwrap();
        assert!(limiter.check("alice").is_err());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.check("alice").is_ok());
    }
}

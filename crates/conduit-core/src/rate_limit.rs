//! Token-bucket rate limiter (C4) shared across an engine's turns.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: f64,
    pub burst: f64,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60.0,
            burst: 10.0,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RateLimitStats {
    pub total_requests: u64,
    pub throttled_count: u64,
    pub total_wait: Duration,
    pub available_tokens: f64,
    pub enabled: bool,
}

struct Inner {
    tokens: f64,
    last_update: Instant,
    total_requests: u64,
    throttled_count: u64,
    total_wait: Duration,
}

/// Async token bucket. The refill calculation happens under the lock; the
/// actual sleep happens with the lock released so other callers are not
/// blocked behind one caller's wait.
pub struct RateLimiter {
    config: RateLimitConfig,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let burst = config.burst;
        Self {
            config,
            inner: Mutex::new(Inner {
                tokens: burst,
                last_update: Instant::now(),
                total_requests: 0,
                throttled_count: 0,
                total_wait: Duration::ZERO,
            }),
        }
    }

    fn refill_rate(&self) -> f64 {
        self.config.requests_per_minute / 60.0
    }

    /// Blocks until a token is available, returning how long it waited.
    pub async fn acquire(&self) -> Duration {
        if !self.config.enabled {
            return Duration::ZERO;
        }

        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                inner.total_requests += 1;
                let now = Instant::now();
                let elapsed = now.duration_since(inner.last_update).as_secs_f64();
                inner.tokens = (inner.tokens + elapsed * self.refill_rate()).min(self.config.burst);
                inner.last_update = now;

                if inner.tokens >= 1.0 {
                    inner.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - inner.tokens;
                    let wait_secs = deficit / self.refill_rate();
                    inner.tokens = 0.0;
                    inner.throttled_count += 1;
                    let wait = Duration::from_secs_f64(wait_secs.max(0.0));
                    inner.total_wait += wait;
                    Some(wait)
                }
            };

            match wait {
                None => return Duration::ZERO,
                Some(wait) => {
                    tokio::time::sleep(wait).await;
                    return wait;
                }
            }
        }
    }

    /// Non-blocking variant: returns `true` iff a token was available and consumed.
    pub async fn try_acquire(&self) -> bool {
        if !self.config.enabled {
            return true;
        }
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_update).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * self.refill_rate()).min(self.config.burst);
        inner.last_update = now;
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            inner.total_requests += 1;
            true
        } else {
            false
        }
    }

    pub async fn stats(&self) -> RateLimitStats {
        let inner = self.inner.lock().await;
        RateLimitStats {
            total_requests: inner.total_requests,
            throttled_count: inner.throttled_count,
            total_wait: inner.total_wait,
            available_tokens: inner.tokens,
            enabled: self.config.enabled,
        }
    }

    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.tokens = self.config.burst;
        inner.last_update = Instant::now();
        inner.total_requests = 0;
        inner.throttled_count = 0;
        inner.total_wait = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_within_burst_without_waiting() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60.0,
            burst: 3.0,
            enabled: true,
        });
        for _ in 0..3 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn disabled_limiter_never_waits() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 1.0,
            burst: 1.0,
            enabled: false,
        });
        for _ in 0..10 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn try_acquire_fails_once_exhausted() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60.0,
            burst: 1.0,
            enabled: true,
        });
        assert!(limiter.try_acquire().await);
        assert!(!limiter.try_acquire().await);
    }
}

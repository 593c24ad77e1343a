//! Per-IP rate limiting.
//!
//! Fixed-window counters per minute and per hour. With `REDIS_URL` set the
//! counters live in Redis (`INCR` + `EXPIRE`) so every server instance
//! shares them; otherwise an in-process map provides the same semantics for
//! single-node deployments.

use std::collections::HashMap;

use parking_lot::Mutex;
use redis::AsyncCommands;

use crate::config::RateLimit;

/// Decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Under both windows.
    Allowed,
    /// Over the minute or hour window.
    Limited,
}

enum Backend {
    Redis(redis::aio::ConnectionManager),
    Memory(Mutex<HashMap<String, u32>>),
}

/// The rate limiter.
pub struct RateLimiter {
    backend: Backend,
    limit: RateLimit,
}

impl RateLimiter {
    /// Connect the Redis backend.
    ///
    /// # Errors
    ///
    /// Returns the Redis connection error; startup treats this as fatal.
    pub async fn redis(url: &str, limit: RateLimit) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let manager = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            backend: Backend::Redis(manager),
            limit,
        })
    }

    /// In-process fallback backend.
    #[must_use]
    pub fn memory(limit: RateLimit) -> Self {
        Self {
            backend: Backend::Memory(Mutex::new(HashMap::new())),
            limit,
        }
    }

    /// Count one request for `key` (normally the client IP) and decide.
    ///
    /// Fails open: a Redis error logs and allows, since refusing all
    /// traffic on a rate limiter outage is the worse failure.
    pub async fn check(&self, key: &str) -> RateDecision {
        let now = chrono::Utc::now().timestamp();
        let minute_window = now / 60;
        let hour_window = now / 3600;
        let minute_key = format!("gough:rl:{key}:m:{minute_window}");
        let hour_key = format!("gough:rl:{key}:h:{hour_window}");

        match &self.backend {
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let result: Result<(u32, u32), redis::RedisError> = async {
                    let minute: u32 = conn.incr(&minute_key, 1u32).await?;
                    let _: () = conn.expire(&minute_key, 60).await?;
                    let hour: u32 = conn.incr(&hour_key, 1u32).await?;
                    let _: () = conn.expire(&hour_key, 3600).await?;
                    Ok((minute, hour))
                }
                .await;

                match result {
                    Ok((minute, hour)) => self.decide(minute, hour),
                    Err(e) => {
                        tracing::error!(error = %e, "rate limiter backend failed, allowing");
                        RateDecision::Allowed
                    }
                }
            }
            Backend::Memory(counters) => {
                let mut counters = counters.lock();
                // Drop windows that can no longer match.
                if counters.len() > 10_000 {
                    counters.clear();
                }
                let minute = {
                    let entry = counters.entry(minute_key).or_insert(0);
                    *entry += 1;
                    *entry
                };
                let hour = {
                    let entry = counters.entry(hour_key).or_insert(0);
                    *entry += 1;
                    *entry
                };
                self.decide(minute, hour)
            }
        }
    }

    fn decide(&self, minute: u32, hour: u32) -> RateDecision {
        if minute > self.limit.per_minute || hour > self.limit.per_hour {
            RateDecision::Limited
        } else {
            RateDecision::Allowed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_limits_per_minute() {
        let limiter = RateLimiter::memory(RateLimit {
            per_minute: 3,
            per_hour: 100,
        });

        for _ in 0..3 {
            assert_eq!(limiter.check("203.0.113.1").await, RateDecision::Allowed);
        }
        assert_eq!(limiter.check("203.0.113.1").await, RateDecision::Limited);

        // A different key has its own window.
        assert_eq!(limiter.check("203.0.113.2").await, RateDecision::Allowed);
    }

    #[tokio::test]
    async fn hour_window_applies() {
        let limiter = RateLimiter::memory(RateLimit {
            per_minute: 100,
            per_hour: 2,
        });

        assert_eq!(limiter.check("k").await, RateDecision::Allowed);
        assert_eq!(limiter.check("k").await, RateDecision::Allowed);
        assert_eq!(limiter.check("k").await, RateDecision::Limited);
    }
}

//! Per-account request budget.
//!
//! A token bucket per account: `capacity` tokens, refilled continuously over
//! `window`. Time comes from `tokio::time`, so paused-clock tests can drive it.

use std::time::Duration;

use courier_core::{AccountId, CourierError, Result};
use dashmap::DashMap;
use metrics::counter;
use tokio::time::Instant;
use tracing::debug;

use crate::metrics::RATE_LIMITED_TOTAL;

/// Bucket shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests allowed in a burst.
    pub capacity: u32,
    /// Time to refill an empty bucket.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 120,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    updated: Instant,
}

/// Token-bucket limiter keyed by account.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<AccountId, Bucket>,
}

impl RateLimiter {
    /// Create a limiter.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    fn refill_per_sec(&self) -> f64 {
        let window = self.config.window.as_secs_f64().max(f64::EPSILON);
        f64::from(self.config.capacity) / window
    }

    /// Spend one token for `account`.
    ///
    /// Returns [`CourierError::RateLimited`] with the wait until the next
    /// token when the bucket is empty.
    pub fn check(&self, account: &AccountId) -> Result<()> {
        let now = Instant::now();
        let capacity = f64::from(self.config.capacity);
        let rate = self.refill_per_sec();
        let mut bucket = self.buckets.entry(account.clone()).or_insert(Bucket {
            tokens: capacity,
            updated: now,
        });

        let elapsed = now.duration_since(bucket.updated).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
        bucket.updated = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let wait_secs = (1.0 - bucket.tokens) / rate;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let retry_after_ms = (wait_secs * 1000.0).ceil() as u64;
        counter!(RATE_LIMITED_TOTAL).increment(1);
        debug!(account_id = %account, retry_after_ms, "rate limited");
        Err(CourierError::RateLimited { retry_after_ms })
    }

    /// Drop buckets that have fully refilled.
    pub fn prune(&self) {
        let now = Instant::now();
        let window = self.config.window;
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.updated) < window);
    }

    /// Number of tracked accounts.
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}

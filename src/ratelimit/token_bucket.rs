//! Token bucket limiter.
//!
//! Each key owns a bucket holding up to `burst` tokens. A request spends one
//! token; tokens come back at `rate` per minute. When a bucket is empty but
//! its one-minute reset deadline has passed, it starts a fresh window.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::Limiter;
use super::clock::{to_delta, Clock, SystemClock};
use super::decision::{Decision, RateLimitInfo};
use super::store::{IdleState, StateMap};

/// Length of one refill period.
const REFILL_PERIOD_MS: u64 = 60_000;

/// Per-key bucket.
#[derive(Debug, Clone)]
pub struct TokenBucketState {
    pub tokens: u32,
    /// Point up to which elapsed time has been converted into tokens
    pub last_fill: DateTime<Utc>,
    pub reset_time: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl IdleState for TokenBucketState {
    fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }
}

impl TokenBucketState {
    fn fresh(burst: u32, now: DateTime<Utc>) -> Self {
        Self {
            tokens: burst - 1,
            last_fill: now,
            reset_time: now + TimeDelta::milliseconds(REFILL_PERIOD_MS as i64),
            last_seen: now,
        }
    }

    /// Credit tokens for the time since `last_fill`.
    ///
    /// Only the time converted into whole tokens is consumed, so the
    /// fractional remainder keeps accruing across calls. A full bucket
    /// discards any surplus.
    fn refill(&mut self, rate: u32, burst: u32, now: DateTime<Utc>) {
        if rate == 0 {
            return;
        }

        let elapsed_ms = (now - self.last_fill).num_milliseconds().max(0) as u64;
        let earned = elapsed_ms.saturating_mul(rate as u64) / REFILL_PERIOD_MS;
        if earned == 0 {
            return;
        }

        let tokens = (self.tokens as u64).saturating_add(earned);
        if tokens >= burst as u64 {
            self.tokens = burst;
            self.last_fill = now;
        } else {
            self.tokens = tokens as u32;
            let consumed_ms = earned * REFILL_PERIOD_MS / rate as u64;
            self.last_fill += TimeDelta::milliseconds(consumed_ms as i64);
        }
    }
}

/// Fixed-rate refill limiter with burst capacity.
pub struct TokenBucketLimiter {
    rate: u32,
    burst: u32,
    ttl: Duration,
    buckets: StateMap<TokenBucketState>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    /// Create a limiter refilling `rate` tokens per minute up to `burst`.
    ///
    /// A `burst` of zero is treated as one so every key can make at least
    /// one request per window.
    pub fn new(rate: u32, burst: u32, ttl: Duration) -> Self {
        Self::with_clock(rate, burst, ttl, Arc::new(SystemClock))
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(rate: u32, burst: u32, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            rate,
            burst: burst.max(1),
            ttl,
            buckets: StateMap::new(),
            clock,
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Current token count for `key`, without refilling.
    pub fn tokens(&self, key: &str) -> Option<u32> {
        self.buckets.inspect(key, |bucket| bucket.tokens)
    }

    /// Clear all buckets.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    fn info(&self, remaining: u32, reset_time: DateTime<Utc>) -> RateLimitInfo {
        RateLimitInfo {
            limit: self.burst,
            remaining,
            reset_time,
        }
    }
}

impl Limiter for TokenBucketLimiter {
    fn allow(&self, key: &str) -> Decision {
        let now = self.clock.now();
        let (rate, burst) = (self.rate, self.burst);

        trace!(key = %key, "Checking token bucket");

        self.buckets.update(
            key,
            || {
                debug!(key = %key, burst = burst, rate = rate, "Creating new token bucket");
                let bucket = TokenBucketState::fresh(burst, now);
                let decision = Decision::allow(self.info(bucket.tokens, bucket.reset_time));
                (bucket, decision)
            },
            |bucket| {
                bucket.last_seen = now;
                bucket.refill(rate, burst, now);

                if bucket.tokens > 0 {
                    bucket.tokens -= 1;
                    return Decision::allow(self.info(bucket.tokens, bucket.reset_time));
                }

                if now > bucket.reset_time {
                    *bucket = TokenBucketState::fresh(burst, now);
                    return Decision::allow(self.info(bucket.tokens, bucket.reset_time));
                }

                debug!(key = %key, reset_time = %bucket.reset_time, "Token bucket exhausted");
                Decision::deny(self.info(0, bucket.reset_time))
            },
        )
    }

    fn reset(&self, key: &str) {
        if self.buckets.remove(key) {
            debug!(key = %key, "Token bucket reset");
        }
    }

    fn limit(&self) -> u32 {
        self.burst
    }

    fn idle_ttl(&self) -> Duration {
        self.ttl
    }

    fn evict_idle(&self) -> usize {
        self.buckets.evict_idle(self.clock.now(), to_delta(self.ttl))
    }

    fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

//! Sliding window limiter.
//!
//! Counts the requests each key made during the trailing window and admits
//! while that count is below the limit. Memory per key grows with the
//! number of requests inside the window.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::Limiter;
use super::clock::{to_delta, Clock, SystemClock};
use super::decision::{Decision, RateLimitInfo};
use super::store::{IdleState, StateMap};

/// Per-key request log, oldest first.
#[derive(Debug, Clone)]
pub struct SlidingWindowState {
    pub requests: VecDeque<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
}

impl IdleState for SlidingWindowState {
    fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }
}

impl SlidingWindowState {
    /// Drop timestamps that no longer fall inside `(now - window, now]`.
    ///
    /// The log is ordered, so only the expired prefix is touched.
    fn prune(&mut self, now: DateTime<Utc>, window: TimeDelta) {
        while let Some(&oldest) = self.requests.front() {
            if now - oldest >= window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Limiter admitting at most `limit` requests per key in any trailing
/// `window`.
pub struct SlidingWindowLimiter {
    limit: u32,
    window: TimeDelta,
    ttl: Duration,
    windows: StateMap<SlidingWindowState>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    /// Create a limiter allowing `limit` requests per `window`.
    ///
    /// A `limit` of zero is treated as one.
    pub fn new(limit: u32, window: Duration, ttl: Duration) -> Self {
        Self::with_clock(limit, window, ttl, Arc::new(SystemClock))
    }

    /// Create a limiter reading time from `clock`.
    pub fn with_clock(limit: u32, window: Duration, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            limit: limit.max(1),
            window: to_delta(window),
            ttl,
            windows: StateMap::new(),
            clock,
        }
    }

    /// Number of requests currently counted for `key`, as of the last call.
    pub fn counted(&self, key: &str) -> Option<usize> {
        self.windows.inspect(key, |state| state.requests.len())
    }

    /// Clear all windows.
    pub fn clear(&self) {
        self.windows.clear();
    }

    fn reset_at(&self, oldest: DateTime<Utc>) -> DateTime<Utc> {
        oldest
            .checked_add_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Limiter for SlidingWindowLimiter {
    fn allow(&self, key: &str) -> Decision {
        let now = self.clock.now();
        let limit = self.limit;

        trace!(key = %key, "Checking sliding window");

        self.windows.update(
            key,
            || {
                debug!(key = %key, limit = limit, "Creating new sliding window");
                let state = SlidingWindowState {
                    requests: VecDeque::from([now]),
                    last_seen: now,
                };
                let decision = Decision::allow(RateLimitInfo {
                    limit,
                    remaining: limit - 1,
                    reset_time: self.reset_at(now),
                });
                (state, decision)
            },
            |state| {
                state.last_seen = now;
                state.prune(now, self.window);

                let count = state.requests.len() as u32;
                if count < limit {
                    state.requests.push_back(now);
                    let oldest = state.requests.front().copied().unwrap_or(now);
                    return Decision::allow(RateLimitInfo {
                        limit,
                        remaining: limit - count - 1,
                        reset_time: self.reset_at(oldest),
                    });
                }

                let oldest = state.requests.front().copied().unwrap_or(now);
                debug!(key = %key, count = count, "Sliding window full");
                Decision::deny(RateLimitInfo {
                    limit,
                    remaining: 0,
                    reset_time: self.reset_at(oldest),
                })
            },
        )
    }

    fn reset(&self, key: &str) {
        if self.windows.remove(key) {
            debug!(key = %key, "Sliding window reset");
        }
    }

    fn limit(&self) -> u32 {
        self.limit
    }

    fn idle_ttl(&self) -> Duration {
        self.ttl
    }

    fn evict_idle(&self) -> usize {
        self.windows.evict_idle(self.clock.now(), to_delta(self.ttl))
    }

    fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

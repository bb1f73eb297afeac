//! Limiter trait for abstracting over the admission algorithms.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::decision::Decision;

/// Trait for limiter implementations.
///
/// This trait abstracts over the `TokenBucketLimiter` and the
/// `SlidingWindowLimiter` so the HTTP middleware and the background
/// reclaimer can work with either.
pub trait Limiter: Send + Sync {
    /// Record one request for `key` and decide whether it is admitted.
    fn allow(&self, key: &str) -> Decision;

    /// Forget all state for `key`. The next `allow` behaves like a first call.
    fn reset(&self, key: &str);

    /// Configured ceiling reported in `X-RateLimit-Limit`.
    fn limit(&self) -> u32;

    /// How long a key may stay idle before its state is reclaimed.
    fn idle_ttl(&self) -> Duration;

    /// Evict state for keys idle longer than [`Limiter::idle_ttl`].
    /// Returns the number of evicted keys.
    fn evict_idle(&self) -> usize;

    /// Number of keys currently holding state.
    fn tracked_keys(&self) -> usize;

    /// Current time on the clock this limiter decides against.
    fn now(&self) -> DateTime<Utc>;
}

//! Route-scoped limiter selection.
//!
//! A [`LimiterSet`] is built once at startup: every configured route gets
//! its own limiter with its own limit, and everything else shares a single
//! default limiter. The table is never modified afterwards, so lookups need
//! no locking.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::backend::Limiter;
use super::clock::{Clock, SystemClock};
use super::reclaimer::Reclaimer;
use super::sliding_window::SlidingWindowLimiter;
use super::token_bucket::TokenBucketLimiter;
use crate::config::{Algorithm, RateLimitingConfig};

/// Name used for the shared limiter in logs.
pub const DEFAULT_LIMITER: &str = "default";

/// Immutable mapping of route to limiter with a shared fallback.
pub struct LimiterSet {
    default: Arc<dyn Limiter>,
    routes: HashMap<String, Arc<dyn Limiter>>,
    reclaimers: Mutex<Vec<Reclaimer>>,
}

impl LimiterSet {
    /// Create a set from already constructed limiters. No reclaimers are
    /// started; see [`LimiterSet::start_reclaimers`].
    pub fn new(default: Arc<dyn Limiter>, routes: HashMap<String, Arc<dyn Limiter>>) -> Self {
        Self {
            default,
            routes,
            reclaimers: Mutex::new(Vec::new()),
        }
    }

    /// A set with only the shared limiter.
    pub fn single(limiter: Arc<dyn Limiter>) -> Self {
        Self::new(limiter, HashMap::new())
    }

    /// Build every limiter described by `config` and start their
    /// reclaimers. Must be called from within a tokio runtime.
    pub fn from_config(config: &RateLimitingConfig) -> Self {
        Self::from_config_with_clock(config, Arc::new(SystemClock))
    }

    /// Like [`LimiterSet::from_config`], reading time from `clock`.
    pub fn from_config_with_clock(config: &RateLimitingConfig, clock: Arc<dyn Clock>) -> Self {
        let default = build_limiter(config, config.rate, config.burst, clock.clone());

        let routes = config
            .endpoints
            .iter()
            .map(|(route, limit)| {
                let burst = limit.burst.unwrap_or(config.burst);
                let limiter = build_limiter(config, limit.rate, burst, clock.clone());
                info!(route = %route, rate = limit.rate, burst = burst, "Route limiter configured");
                (route.clone(), limiter)
            })
            .collect();

        let set = Self::new(default, routes);
        set.start_reclaimers();

        info!(
            algorithm = ?config.algorithm,
            rate = config.rate,
            burst = config.burst,
            routes = set.routes.len(),
            "Rate limiters initialized"
        );

        set
    }

    /// Spawn one reclaimer per limiter.
    pub fn start_reclaimers(&self) {
        let mut reclaimers = self.reclaimers.lock();
        reclaimers.push(Reclaimer::spawn(DEFAULT_LIMITER, &self.default));
        for (route, limiter) in &self.routes {
            reclaimers.push(Reclaimer::spawn(route.clone(), limiter));
        }
    }

    /// Limiter responsible for `route`.
    pub fn select(&self, route: &str) -> &Arc<dyn Limiter> {
        self.routes.get(route).unwrap_or(&self.default)
    }

    /// The shared limiter for unmapped routes.
    pub fn default_limiter(&self) -> &Arc<dyn Limiter> {
        &self.default
    }

    /// Whether `route` owns a dedicated limiter.
    pub fn has_route(&self, route: &str) -> bool {
        self.routes.contains_key(route)
    }

    /// Stop every reclaimer and wait for them to exit.
    pub async fn shutdown(&self) {
        let reclaimers = std::mem::take(&mut *self.reclaimers.lock());
        let count = reclaimers.len();
        for reclaimer in reclaimers {
            reclaimer.shutdown().await;
        }
        if count > 0 {
            info!(reclaimers = count, "Rate limiter reclaimers stopped");
        }
    }
}

fn build_limiter(
    config: &RateLimitingConfig,
    rate: u32,
    burst: u32,
    clock: Arc<dyn Clock>,
) -> Arc<dyn Limiter> {
    let ttl: Duration = config.ttl();
    match config.algorithm {
        Algorithm::TokenBucket => Arc::new(TokenBucketLimiter::with_clock(rate, burst, ttl, clock)),
        Algorithm::SlidingWindow => Arc::new(SlidingWindowLimiter::with_clock(
            rate,
            config.window(),
            ttl,
            clock,
        )),
    }
}

//! Admission decision values returned by limiters.

use chrono::{DateTime, Utc};

/// Advisory quota information for one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Configured ceiling
    pub limit: u32,
    /// Requests still available
    pub remaining: u32,
    /// When the next slot frees or the bucket fully refills
    pub reset_time: DateTime<Utc>,
}

impl RateLimitInfo {
    /// Whole seconds from `now` until `reset_time`, rounded up and never
    /// below one so clients always back off.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_time - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }

    /// `reset_time` as Unix epoch seconds.
    pub fn reset_epoch_secs(&self) -> i64 {
        self.reset_time.timestamp()
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub info: RateLimitInfo,
}

impl Decision {
    pub fn allow(info: RateLimitInfo) -> Self {
        Self {
            allowed: true,
            info,
        }
    }

    pub fn deny(info: RateLimitInfo) -> Self {
        Self {
            allowed: false,
            info,
        }
    }
}

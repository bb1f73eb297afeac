//! Rate limiting algorithms and per-key state management.

mod backend;
pub mod clock;
mod decision;
mod reclaimer;
mod registry;
mod sliding_window;
mod store;
mod token_bucket;

pub use backend::Limiter;
pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, RateLimitInfo};
pub use reclaimer::Reclaimer;
pub use registry::{LimiterSet, DEFAULT_LIMITER};
pub use sliding_window::{SlidingWindowLimiter, SlidingWindowState};
pub use store::{IdleState, StateMap};
pub use token_bucket::{TokenBucketLimiter, TokenBucketState};

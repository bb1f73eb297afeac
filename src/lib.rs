//! Turnstile - In-Process Request Admission Control
//!
//! This crate decides, per client key, whether an inbound HTTP request may
//! proceed. It provides token bucket and sliding window limiters with
//! background reclamation of idle keys, key derivation policies, and an
//! axum middleware that attaches quota headers and rejects over-limit
//! requests with `429 Too Many Requests`.

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod ratelimit;

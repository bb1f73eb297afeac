//! HTTP integration: key derivation, admission middleware and the server.

mod keys;
mod middleware;
mod server;

pub use keys::{api_key, client_ip, route_of, AuthenticatedUser, KeyPolicy};
pub use middleware::{
    admission_middleware, AdmissionState, RateLimitRejection, X_RATELIMIT_LIMIT,
    X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::HttpServer;

//! Key derivation policies.
//!
//! Each policy maps a request to the string a limiter counts against. Keys
//! carry a namespace prefix so that, for example, a user id can never
//! collide with an IP address.

use axum::extract::{ConnectInfo, MatchedPath};
use axum::http::{header, HeaderMap, Request};
use std::net::SocketAddr;

/// Identity of the caller, inserted into request extensions by an upstream
/// authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

/// Which request attribute a limit applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Resolved client IP address
    #[default]
    Ip,
    /// Authenticated principal, falling back to IP
    User,
    /// API credential, falling back to IP
    ApiKey,
    /// Route plus client IP
    Endpoint,
}

impl KeyPolicy {
    /// Derive the rate limit key for `req`.
    ///
    /// Returns `None` when nothing identifies the caller; such requests are
    /// not rate limited rather than all being counted under one key.
    pub fn derive<B>(&self, req: &Request<B>) -> Option<String> {
        match self {
            KeyPolicy::Ip => ip_key(req),
            KeyPolicy::User => req
                .extensions()
                .get::<AuthenticatedUser>()
                .map(|user| user.0.trim())
                .filter(|id| !id.is_empty())
                .map(|id| format!("user:{}", id))
                .or_else(|| ip_key(req)),
            KeyPolicy::ApiKey => api_key(req.headers())
                .map(|key| format!("api:{}", key))
                .or_else(|| ip_key(req)),
            KeyPolicy::Endpoint => {
                let ip = client_ip(req)?;
                Some(format!("endpoint:{}:ip:{}", route_of(req), ip))
            }
        }
    }
}

fn ip_key<B>(req: &Request<B>) -> Option<String> {
    client_ip(req).map(|ip| format!("ip:{}", ip))
}

/// Resolve the client IP: first `X-Forwarded-For` hop, then `X-Real-IP`,
/// then the peer address of the connection.
pub fn client_ip<B>(req: &Request<B>) -> Option<String> {
    let headers = req.headers();

    if let Some(ip) = header_str(headers, "x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return Some(ip.to_string());
    }

    if let Some(ip) = header_str(headers, "x-real-ip")
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return Some(ip.to_string());
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// API credential from `X-API-Key`, else an `Authorization: Bearer` token.
pub fn api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = header_str(headers, "x-api-key")
        .map(str::trim)
        .filter(|key| !key.is_empty())
    {
        return Some(key);
    }

    header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Route used for limiter selection: the matched route template when the
/// router has already resolved one, otherwise the request path.
pub fn route_of<B>(req: &Request<B>) -> &str {
    req.extensions()
        .get::<MatchedPath>()
        .map(MatchedPath::as_str)
        .unwrap_or_else(|| req.uri().path())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

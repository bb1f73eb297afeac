//! HTTP server implementation.

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{admission_middleware, AdmissionState};
use crate::error::{Result, TurnstileError};

/// HTTP server fronting the sample routes with admission control.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Admission state; `None` when rate limiting is disabled
    admission: Option<AdmissionState>,
}

impl HttpServer {
    /// Create a new server. Pass `None` to serve without rate limiting.
    pub fn new(addr: SocketAddr, admission: Option<AdmissionState>) -> Self {
        Self { addr, admission }
    }

    /// Build the router, with the admission layer when enabled.
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/health", get(health))
            .route("/ready", get(ready))
            .route("/api/ping", get(ping));

        match &self.admission {
            Some(state) => router.layer(axum::middleware::from_fn_with_state(
                state.clone(),
                admission_middleware,
            )),
            None => router,
        }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TurnstileError::Io(e)
        })?;

        info!(
            addr = %self.addr,
            rate_limiting = self.admission.is_some(),
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ready() -> Json<Value> {
    Json(json!({ "status": "ready" }))
}

async fn ping() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}

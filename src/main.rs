use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};

use turnstile::config::{LoggingConfig, TurnstileConfig};
use turnstile::http::{AdmissionState, HttpServer};
use turnstile::logging;

/// In-process request admission control for HTTP services.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match TurnstileConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            // The configured logger is unknown until the file parses.
            logging::init(&LoggingConfig::default())?;
            error!(config = ?cli.config, error = %e, "Failed to load configuration");
            return Err(e.into());
        }
    };
    if let Some(addr) = cli.listen {
        config.server.http_addr = addr;
    }

    logging::init(&config.logging)?;

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        config = ?cli.config,
        http_addr = %config.server.http_addr,
        "Configuration loaded"
    );

    let admission = if config.rate_limiting.enabled {
        let state = AdmissionState::from_config(&config.rate_limiting);
        info!(policy = ?state.policy(), "Rate limiting enabled");
        Some(state)
    } else {
        info!("Rate limiting disabled");
        None
    };

    let server = HttpServer::new(config.server.http_addr, admission.clone());
    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(state) = admission {
        state.limiters().shutdown().await;
    }

    info!("Turnstile stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

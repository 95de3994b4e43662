//! s3browse -- single-bucket S3 gateway.
//!
//! Loads configuration, installs logging and metrics, and serves the
//! gateway router until SIGTERM/SIGINT.  In-flight requests are given
//! `server.shutdown_timeout` seconds to finish.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the gateway.
#[derive(Parser, Debug)]
#[command(
    name = "s3browse",
    version,
    about = "Single-bucket S3 gateway with bulk prefix operations"
)]
struct Cli {
    /// Path to the YAML configuration file. A missing file is fine when the
    /// S3_* environment variables carry every required value.
    #[arg(short, long, default_value = "s3browse.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

fn init_tracing(config: &s3browse::config::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = s3browse::config::load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Configuration loaded from {} (plus environment)", cli.config);

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    if config.observability.metrics {
        s3browse::metrics::init_metrics()?;
        info!("Prometheus metrics initialized");
    }

    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let state = Arc::new(s3browse::AppState::new(config)?);
    info!(
        "Forwarding bucket '{}' at {} (region {})",
        state.bucket(),
        state.origin,
        state.config.upstream.region
    );

    let app = s3browse::server::app(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("s3browse listening on {}", bind_addr);

    let (signalled_tx, signalled_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signalled_tx.send(());
    });

    tokio::select! {
        result = server.into_future() => result?,
        _ = async {
            let _ = signalled_rx.await;
            tokio::time::sleep(shutdown_timeout).await;
        } => {
            warn!("In-flight requests still running after {:?}; exiting", shutdown_timeout);
        }
    }

    info!("s3browse shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}

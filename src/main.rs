use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use quotaguard::config::ServiceConfig;
use quotaguard::http::HttpServer;
use quotaguard::ratelimit::{QuotaPolicyTable, RateLimiter};
use quotaguard::store;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Per-caller API quota decision service.
#[derive(Debug, Parser)]
#[command(name = "quotaguard", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting Quotaguard");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config =
        ServiceConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(listen) = args.listen {
        config.server.http_addr = listen;
    }
    info!(
        http_addr = %config.server.http_addr,
        exempt_paths = ?config.server.exempt_paths,
        "Configuration loaded"
    );

    let policies = match config.policies.path.as_deref() {
        Some(path) => QuotaPolicyTable::from_file(path)
            .with_context(|| format!("Failed to load quota policies from {}", path))?,
        None => {
            info!("No policy file configured, using built-in quota policies");
            QuotaPolicyTable::default()
        }
    };

    let store = store::connect(&config.store).await;
    if config.store.redis_url.is_some() && store.backend() != store::StoreBackend::Redis {
        warn!("Quotas are enforced per process until Redis is reachable and the service restarts");
    }

    let limiter = Arc::new(RateLimiter::new(store, Arc::new(policies)));
    info!(backend = %limiter.backend(), "Rate limiter initialized");

    HttpServer::new(config.server.http_addr, limiter, config.server.exempt_paths)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Quotaguard stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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

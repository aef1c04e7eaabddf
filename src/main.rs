//! # Biblioteca+ API Gateway - Main Entry Point
//!
//! Loads the configuration, installs logging and metrics, binds the proxy and
//! admin listeners and serves until SIGTERM or Ctrl+C.
//!
//! ## Startup Sequence
//! 1. Read `GATEWAY_CONFIG_PATH` (default `config/gateway.yaml`), apply
//!    environment overrides and validate. Any problem aborts with exit code 1.
//! 2. Install the tracing subscriber and, if enabled, the Prometheus recorder.
//! 3. Build the gateway and bind both listeners.
//! 4. Serve. On a shutdown signal, stop accepting, drain in-flight requests
//!    and stop health probing.

use anyhow::Context;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use biblioteca_gateway::core::config::{CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};
use biblioteca_gateway::observability::{init_logging, metrics};
use biblioteca_gateway::{Gateway, GatewayConfig, GatewayServer};

#[tokio::main]
async fn main() {
    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    // Logging is not up yet, so configuration problems go straight to stderr
    let config = match GatewayConfig::load_from_file(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.observability.logging) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    info!("🚀 Starting Biblioteca+ API Gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("📋 Configuration loaded from {}", config_path);

    if let Err(e) = run(config).await {
        error!("Gateway terminated with error: {:#}", e);
        std::process::exit(1);
    }

    info!("✅ API Gateway shutdown complete");
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let prometheus_enabled = config.observability.metrics.prometheus_enabled;

    let mut gateway = Gateway::from_config(config).context("Failed to build gateway")?;
    if prometheus_enabled {
        let handle = metrics::install_prometheus().context("Failed to enable metrics")?;
        gateway = gateway.with_metrics(handle);
        info!("📊 Prometheus metrics enabled");
    }

    let server = GatewayServer::bind(gateway).await?;
    info!("🌐 Gateway listening on {}", server.local_addr()?);
    info!("🔧 Admin API listening on {}", server.admin_local_addr()?);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("🛑 Shutdown signal received, draining in-flight requests...");
        signal_token.cancel();
    });

    server.run(shutdown).await?;
    Ok(())
}

/// Resolve on SIGTERM or Ctrl+C
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("📡 Received SIGINT (Ctrl+C)"),
        _ = terminate => info!("📡 Received SIGTERM"),
    }
}

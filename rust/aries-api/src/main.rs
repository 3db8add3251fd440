//! Aries API - Main Entry Point
//!
//! Serves the AI gateway and the remote worker coordinator as one process.

use clap::Parser;
use mimalloc::MiMalloc;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use aries_api::config::AriesConfig;
use aries_api::server::{coordinator_app, create_services};

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "aries-api")]
#[command(about = "Aries API - AI Gateway and Swarm execution fabric")]
#[command(version)]
struct Args {
    /// Host to bind to.
    #[arg(long, env = "ARIES_API_HOST")]
    host: Option<String>,

    /// Gateway port.
    #[arg(short, long, env = "ARIES_API_PORT")]
    port: Option<u16>,

    /// Log level.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    /// Emit JSON-formatted logs.
    #[arg(long, env = "ARIES_LOG_JSON")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.json_logs);

    tracing::info!(
        "Starting Aries API v{} (gateway + coordinator + swarm)",
        env!("CARGO_PKG_VERSION")
    );

    let mut config = AriesConfig::load()?;
    if let Some(host) = args.host {
        config.gateway.host = host;
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    tracing::info!("Configuration loaded");

    let gateway_addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let coordinator_addr = format!("{}:{}", config.gateway.host, config.remote_workers.port);

    let services = create_services(config).await?;

    // Coordinator listener on its own port.
    if let Some(coordinator) = services.coordinator.clone() {
        let listener = tokio::net::TcpListener::bind(&coordinator_addr).await?;
        tracing::info!("Coordinator listening on {}", coordinator_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, coordinator_app(coordinator)).await {
                tracing::error!(error = %e, "coordinator listener failed");
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&gateway_addr).await?;
    tracing::info!("Gateway listening on {}", gateway_addr);

    let state = services.state.clone();
    axum::serve(
        listener,
        services
            .app
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Final flush so the usage file reflects the full process lifetime.
    state.gateway.usage().flush().await;
    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Initialize tracing/logging.
fn init_tracing(log_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}

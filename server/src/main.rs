//! Drivewatch Server - Main entry point.
//!
//! This binary starts the Drivewatch server with:
//! - Structured JSON logging for production
//! - The watch channel renewal scheduler
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`drivewatch_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! DRIVEWATCH_PUBLIC_URL="https://chat.example.com/plugins/drive" \
//! DRIVEWATCH_GOOGLE_CLIENT_ID="..." \
//! DRIVEWATCH_GOOGLE_CLIENT_SECRET="..." \
//! DRIVEWATCH_CHAT_WEBHOOK_URL="https://chat.example.com/hooks/dm" \
//! DRIVEWATCH_STORE_PATH=/var/lib/drivewatch/store.json \
//! PORT=8080 \
//! cargo run --release --bin drivewatch-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use drivewatch_server::broker::OAuthBroker;
use drivewatch_server::config::Config;
use drivewatch_server::renewal::{RenewalScheduler, Renewer};
use drivewatch_server::routes::{create_router, AppState};
use drivewatch_server::store::{KvStore, MemoryKvStore};

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            eprintln!("  DRIVEWATCH_PUBLIC_URL            - Public URL of this server");
            eprintln!("  DRIVEWATCH_GOOGLE_CLIENT_ID      - Google OAuth client ID");
            eprintln!("  DRIVEWATCH_GOOGLE_CLIENT_SECRET  - Google OAuth client secret");
            eprintln!("  DRIVEWATCH_CHAT_WEBHOOK_URL      - Direct message endpoint");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                             - HTTP server port (default: 8080)");
            eprintln!("  RUST_LOG                         - Log level filter (default: info)");
            eprintln!("  DRIVEWATCH_STORE_PATH            - Snapshot file (default: in-memory)");
            eprintln!("  DRIVEWATCH_CHAT_TOKEN            - Bearer token for the chat endpoint");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %format_args!("{err:#}"), "Server error");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!(
        port = config.port,
        public_url = %config.public_url,
        persistent_store = config.store_path.is_some(),
        renewal_interval_secs = config.renewal.interval.as_secs(),
        renewal_workers = config.renewal.workers,
        "Drivewatch server starting"
    );

    let kv: Arc<dyn KvStore> = match &config.store_path {
        Some(path) => Arc::new(
            MemoryKvStore::open(path)
                .await
                .with_context(|| format!("Failed to open store at {}", path.display()))?,
        ),
        None => {
            warn!("No store path configured, state will be lost on restart");
            Arc::new(MemoryKvStore::new())
        }
    };

    let state = AppState::from_config(&config, kv).context("Failed to create API clients")?;
    let broker = state.broker.clone();

    let renewer = Arc::new(Renewer::new(state.watch.clone(), &config.renewal));
    let scheduler = RenewalScheduler::start(renewer, config.renewal.interval);

    let app = create_router(state);

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;
    info!(port = config.port, address = %bind_addr, "Server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(broker.clone()))
        .await;

    info!("Server shutting down gracefully");

    // Waiters may still be parked if the server stopped for another reason.
    broker.close();
    scheduler.stop().await;
    info!("Renewal scheduler stopped");

    served.context("HTTP server failed")
}

/// Initialize structured logging with tracing.
///
/// JSON output, filtered by `RUST_LOG` with a default of `info`.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Resolves when SIGTERM or SIGINT is received.
///
/// Closes the OAuth broker first: its waiters hold connections open and
/// graceful shutdown waits for every open connection.
async fn shutdown_signal(broker: OAuthBroker) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }

    broker.close();
}

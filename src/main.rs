#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! # echonet-exporter
//!
//! Prometheus exporter for Japanese low-voltage smart meters over the
//! Wi-SUN B-route. The exporter owns a serial SK-style Wi-SUN modem,
//! establishes the PANA session with the meter, and answers `GET /metrics`
//! with readings requested over ECHONET Lite — one Get/Get_Res exchange
//! per scrape.

use std::sync::Arc;
use std::time::Instant;

use axum::{routing::get, Router};
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use echonet_exporter::{routes, state::ScrapeStats, AppState, Config, Meter};

/// Prometheus exporter for ECHONET Lite smart meters over the Wi-SUN B-route.
#[derive(Parser)]
#[command(name = "echonet-exporter", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    // Validate config before proceeding
    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("echonet-exporter v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Serial device: {}", config.wisun.device);
    info!("Listening on {}", config.server.listen);

    if config.wisun.rbid.is_none() {
        warn!("No Route-B credentials configured — relying on the modem's stored registration");
    }

    let meter = match Meter::open(&config.wisun, &config.meter) {
        Ok(meter) => meter,
        Err(e) => {
            tracing::error!("Failed to open Wi-SUN modem: {e}");
            std::process::exit(1);
        }
    };

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        meter,
        scrape_stats: Arc::new(ScrapeStats::new()),
    };

    let app = Router::new()
        .route("/metrics", get(routes::metrics::metrics))
        .route("/api/health", get(routes::health::health))
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            state.config.server.max_connections,
        ));

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Dropping the meter handle closes the channel; the I/O thread exits
    // after its current request.
    info!("Goodbye");
}

//! Raffle Settlement Server
//!
//! This binary:
//! - Connects to `PostgreSQL` and applies migrations
//! - Installs the Prometheus exporter
//! - Serves the purchase, payment and webhook API
//!
//! # Usage
//!
//! ```bash
//! docker compose up -d
//! cargo run --bin server
//! ```

use raffle_core::environment::SystemClock;
use raffle_postgres::PostgresLedgerStore;
use raffle_settlement::server::{AppState, build_router};
use raffle_settlement::{Config, MockPaymentGateway, SettlementEngine, metrics};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,raffle_settlement=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Raffle Settlement Server...");

    let config = Config::from_env();
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        transactions = ?config.settlement.transactions,
        currency = %config.settlement.currency,
        "Configuration loaded"
    );

    // Metrics
    let metrics_addr: SocketAddr =
        format!("{}:{}", config.server.metrics_host, config.server.metrics_port).parse()?;
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()?;
    metrics::register_business_metrics();
    tracing::info!(%metrics_addr, "Prometheus metrics exporter listening");

    // Ledger
    let store =
        PostgresLedgerStore::new(&config.postgres.url, config.postgres.max_connections).await?;
    if config.postgres.run_migrations {
        store.migrate().await?;
        tracing::info!("Migrations complete");
    }

    // Engine
    let engine = SettlementEngine::new(
        Arc::new(store),
        MockPaymentGateway::shared(),
        Arc::new(SystemClock),
        config.settlement.clone(),
    );
    tracing::warn!("Using mock payment gateway");
    let app = build_router(AppState::new(Arc::new(engine)));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Raffle Settlement Server is running");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}

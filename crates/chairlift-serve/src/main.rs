//! Chairlift - lift ride ingestion service.
//!
//! Starts the ingestion pipeline and the HTTP ingress in one process. Rides
//! accepted over HTTP are queued on the AMQP broker, consumed, and written to
//! storage in batches; `Ctrl-C` drains the pipeline before exiting.

use std::sync::Arc;

use anyhow::Context;
use axum::http::Request;
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chairlift_core::metrics::{init_metrics, start_metrics_server};
use chairlift_ingest::{
    AmqpConnection, ClickHouseStore, Connection, IngestService, MemoryBroker, MemoryStore,
    StorageEngine,
};
use chairlift_serve::{AppState, Config, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded environment from {}", path.display());
    }

    let config = Config::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chairlift_ingest=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metrics_port != 0 {
        let handle = init_metrics();
        start_metrics_server(config.metrics_port, handle)
            .await
            .context("failed to start metrics server")?;
    }

    let storage: Arc<dyn StorageEngine> = match config.clickhouse_config() {
        Some(clickhouse) => {
            let store = ClickHouseStore::new(clickhouse, tokio::runtime::Handle::current());
            store
                .ensure_table()
                .await
                .context("failed to prepare ClickHouse table")?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("CLICKHOUSE_URL not set, rides are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let connection: Arc<dyn Connection> = match config.amqp_config() {
        Some(amqp) => Arc::new(
            AmqpConnection::connect(amqp, tokio::runtime::Handle::current())
                .await
                .context("failed to connect to AMQP broker")?,
        ),
        None => {
            tracing::warn!("AMQP_URL not set, queued rides are lost if the process exits");
            Arc::new(MemoryBroker::new())
        }
    };

    // Declaring queues blocks on broker round trips
    let ingest_config = config.ingest_config();
    let service = tokio::task::spawn_blocking(move || {
        IngestService::start(connection, storage, ingest_config)
    })
    .await
    .context("ingest startup panicked")?
    .context("failed to start ingest service")?;

    let state = AppState::new(Arc::clone(service.gateway()));

    // Build router with middleware
    let app = router(state).layer(TraceLayer::new_for_http().make_span_with(
        |request: &Request<_>| {
            tracing::span!(
                Level::INFO,
                "http_request",
                method = %request.method(),
                path = %request.uri().path(),
            )
        },
    ));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "starting server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Workers block on joins and storage writes
    tokio::task::spawn_blocking(move || service.shutdown())
        .await
        .context("ingest shutdown panicked")?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("received Ctrl-C, shutting down");
}

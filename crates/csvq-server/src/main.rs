//! csvq server - main entry point

use anyhow::{Context, Result};
use csvq_common::logging::{init_logging, LogConfig};
use csvq_ingest::DecoderOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use csvq_server::{
    api, broker,
    cache::{RecordCache, RedisCache},
    config::Config,
    consumer::{ConsumerSettings, RecordConsumer},
    db::{self, PgRecordStore, RecordStore},
    features::FeatureState,
    ingest::IngestPublisher,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Environment variables take precedence over these defaults
    let log_config = LogConfig::builder()
        .log_file_prefix("csvq-server")
        .filter_directives("csvq_server=debug,csvq_ingest=info,tower_http=debug,sqlx=warn,lapin=info")
        .build()
        .merge_env()?;

    let _log_guard = init_logging(&log_config)?;

    info!("Starting csvq server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let pool = db::create_pool(&config.database).await?;
    db::migrate(&pool).await?;
    let store: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(pool));

    let broker = broker::connect(&config.broker)
        .await
        .context("Failed to connect to the message broker")?;
    broker.declare_queue(&config.broker.queue).await?;
    info!(queue = %config.broker.queue, "Record queue declared");

    let cache: Arc<dyn RecordCache> = Arc::new(
        RedisCache::connect(&config.cache)
            .await
            .context("Failed to connect to Redis")?,
    );

    let shutdown = CancellationToken::new();
    let consumer = RecordConsumer::new(
        Arc::clone(&broker),
        Arc::clone(&store),
        cache,
        ConsumerSettings::from_config(&config),
    );
    let consumer_handle = tokio::spawn(consumer.run(shutdown.clone()));

    let publisher = IngestPublisher::new(
        broker,
        config.broker.queue.clone(),
        DecoderOptions {
            chunk_size: config.ingest.chunk_size,
            max_line_bytes: config.ingest.max_line_bytes,
        },
    );

    let state = FeatureState {
        store,
        publisher: Arc::new(publisher),
        max_upload_bytes: config.ingest.max_upload_bytes,
    };
    let app = api::create_router(state, &config.cors);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    let timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    match tokio::time::timeout(timeout, consumer_handle).await {
        Ok(joined) => joined.context("Record consumer panicked")?,
        Err(_) => warn!("Record consumer did not stop within {} seconds", timeout.as_secs()),
    }

    info!("Server shut down gracefully");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}

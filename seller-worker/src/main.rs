//! Consume seller creation events and persist them to Postgres in batches.
use std::future::ready;
use std::sync::Arc;

use axum::{http::StatusCode, routing::get, Router};
use common_amqp::{BatchConsumer, ConnectionManager, LapinConnector, Topology};
use common_database::get_pool;
use common_metrics::{serve, setup_metrics_routes};
use common_types::topology::{SELLER_CREATION_QUEUE, SELLER_EXCHANGE};
use common_types::SellerCreatedEvent;
use envconfig::Envconfig;
use health::HealthRegistry;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use seller_worker::config::Config;
use seller_worker::processor::SellerBatchProcessor;
use seller_worker::store::PostgresStore;

fn setup_tracing() -> Result<(), anyhow::Error> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("lapin=warn".parse()?),
    );
    tracing_subscriber::registry().with(log_layer).init();
    Ok(())
}

pub async fn index() -> &'static str {
    "seller worker"
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    setup_tracing()?;
    info!("Starting seller worker...");

    let config = Config::init_from_env()?;
    info!(
        queue = SELLER_CREATION_QUEUE,
        batch_size = config.amqp.amqp_consumer_batch_size,
        max_wait_ms = config.amqp.amqp_max_wait_time_ms.as_millis() as u64,
        max_batch_attempts = config.max_batch_attempts,
        "Configuration loaded"
    );

    let pool = get_pool(&config.database_url, config.max_pg_connections).await?;
    if config.run_migrations {
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations applied");
    }

    let connection = ConnectionManager::new(Arc::new(LapinConnector::new(config.amqp.uri())));

    let health = HealthRegistry::new("liveness");
    let liveness = health.register("seller-consumer", *config.liveness_deadline_ms);

    // Health check server
    let bind = config.bind();
    let readiness = connection.clone();
    let router = Router::new()
        .route("/", get(index))
        .route(
            "/_readiness",
            get(move || {
                ready(match readiness.is_connected() {
                    true => (StatusCode::OK, "ready"),
                    false => (StatusCode::SERVICE_UNAVAILABLE, "broker unavailable"),
                })
            }),
        )
        .route("/_liveness", get(move || ready(health.get_status())));
    let router = setup_metrics_routes(router)?;

    tokio::task::spawn(async move {
        if let Err(err) = serve(router, &bind).await {
            error!(error = %err, "health server stopped");
        }
    });

    // Shutdown signal
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl+c, shutting down");
        }
        info!("Shutdown signal received");
        _ = shutdown_tx.send(true);
    });

    let processor = SellerBatchProcessor::new(
        PostgresStore::new(pool.clone()),
        config.bulk_insert_retry(),
        config.max_batch_attempts,
    )
    .with_failure_ttl(*config.batch_failure_ttl_ms);
    let consumer = BatchConsumer::<SellerCreatedEvent, _>::new(
        connection.clone(),
        Topology::for_queue(SELLER_EXCHANGE, SELLER_CREATION_QUEUE),
        processor,
        config.amqp.consumer_config(&config.consumer_tag),
    )
    .with_liveness(liveness);

    let result = consumer.run(shutdown_rx).await;

    connection.dispose().await;
    pool.close().await;

    result?;
    info!("Seller worker shut down");
    Ok(())
}

//! Publish a file of sellers, CSV or newline-delimited JSON, to the seller exchange.
use std::sync::Arc;

use common_amqp::{BatchPublisher, ConnectionManager, LapinConnector, Topology};
use common_types::topology::{SELLER_CREATION_QUEUE, SELLER_EXCHANGE, SELLER_ROUTING_KEY};
use envconfig::Envconfig;
use tokio::fs::File;
use tokio::io::BufReader;
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use seller_import::config::Config;
use seller_import::parse::{RowReader, UploadFormat};
use seller_import::upload::SellerUploader;

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

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    setup_tracing()?;

    let config = Config::init_from_env()?;
    let publisher_config = config.amqp.publisher_config();
    let format = UploadFormat::from_path(&config.import_file_path);
    info!(
        file = config.import_file_path,
        ?format,
        batch_size = publisher_config.batch_size(),
        "Starting seller import"
    );

    let file = File::open(&config.import_file_path).await?;
    let rows = RowReader::open(BufReader::new(file), format).await?;

    let connection = ConnectionManager::new(Arc::new(LapinConnector::new(config.amqp.uri())));
    let batch_size = publisher_config.batch_size();
    let publisher = BatchPublisher::new(
        connection.clone(),
        Topology::for_queue(SELLER_EXCHANGE, SELLER_CREATION_QUEUE),
        publisher_config,
    );
    let uploader = SellerUploader::new(publisher, SELLER_EXCHANGE, SELLER_ROUTING_KEY, batch_size);

    let result = uploader.upload_rows(rows).await;
    connection.dispose().await;

    let summary = result?;
    info!(
        published = summary.published,
        skipped = summary.skipped,
        "Seller import finished"
    );
    Ok(())
}

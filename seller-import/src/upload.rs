use std::time::Instant;

use common_amqp::{EventPublisher, PublishError};
use common_types::SellerCreatedEvent;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use tracing::{debug, info};

use crate::parse::{ParseError, RowReader};

/// Used when the configured batch size is zero.
pub const FALLBACK_BATCH_SIZE: usize = 2000;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("upload contains no records")]
    NoRecords,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("failed to publish sellers: {0}")]
    Publish(#[from] PublishError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub rows: usize,
    pub skipped: usize,
    pub published: usize,
    pub batches: usize,
}

/// Turns an upload into seller creation events, published in batches as the
/// rows are read.
pub struct SellerUploader<P> {
    publisher: P,
    exchange: String,
    routing_key: String,
    batch_size: usize,
}

impl<P: EventPublisher<SellerCreatedEvent>> SellerUploader<P> {
    pub fn new(publisher: P, exchange: &str, routing_key: &str, batch_size: usize) -> Self {
        Self {
            publisher,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            batch_size: match batch_size {
                0 => FALLBACK_BATCH_SIZE,
                size => size,
            },
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Publishes a newline-delimited JSON upload.
    pub async fn upload<R>(&self, reader: R) -> Result<UploadSummary, ImportError>
    where
        R: AsyncBufRead + Unpin,
    {
        self.upload_rows(RowReader::new(reader)).await
    }

    /// Publishes every row that has an email. Rows are not validated beyond
    /// that, the worker does. Fails when the upload has no rows at all.
    ///
    /// Batches published before a failure stay published.
    pub async fn upload_rows<R>(&self, mut rows: RowReader<R>) -> Result<UploadSummary, ImportError>
    where
        R: AsyncBufRead + Unpin,
    {
        let started = Instant::now();
        let mut summary = UploadSummary::default();
        let mut batch = Vec::with_capacity(self.batch_size);

        while let Some(row) = rows.next_row().await? {
            summary.rows += 1;
            if !row.has_email() {
                summary.skipped += 1;
                continue;
            }

            batch.push(row.into_event());
            if batch.len() >= self.batch_size {
                self.publish(&batch, &mut summary).await?;
                batch.clear();
            }
        }

        if summary.rows == 0 {
            return Err(ImportError::NoRecords);
        }
        if !batch.is_empty() {
            self.publish(&batch, &mut summary).await?;
        }

        metrics::counter!("seller_import_rows_skipped").increment(summary.skipped as u64);
        info!(
            rows = summary.rows,
            skipped = summary.skipped,
            published = summary.published,
            batches = summary.batches,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "upload published"
        );
        Ok(summary)
    }

    async fn publish(
        &self,
        batch: &[SellerCreatedEvent],
        summary: &mut UploadSummary,
    ) -> Result<(), ImportError> {
        let published = self
            .publisher
            .publish_events(batch, &self.exchange, &self.routing_key)
            .await?;
        summary.published += published.events;
        summary.batches += published.batches;
        metrics::counter!("seller_import_events_published").increment(published.events as u64);
        debug!(size = batch.len(), total = summary.published, "upload batch published");
        Ok(())
    }
}

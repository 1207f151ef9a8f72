use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common_retry::{retry, RetryPolicy};
use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, info};

use crate::broker::{BrokerChannel, Confirmation};
use crate::connection::ConnectionManager;
use crate::error::{AmqpError, PublishError};
use crate::topology::Topology;

/// Used when the configured publish batch size is zero.
pub const FALLBACK_PUBLISH_BATCH_SIZE: usize = 2000;

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    pub publish_batch_size: usize,
    pub confirm_timeout_floor: Duration,
    pub confirm_timeout_per_message: Duration,
    pub retry: RetryPolicy,
}

impl PublisherConfig {
    pub fn batch_size(&self) -> usize {
        match self.publish_batch_size {
            0 => FALLBACK_PUBLISH_BATCH_SIZE,
            size => size,
        }
    }

    /// Time allowed for the broker to confirm `messages` published messages.
    pub fn confirm_timeout(&self, messages: usize) -> Duration {
        let messages = u32::try_from(messages).unwrap_or(u32::MAX);
        self.confirm_timeout_floor
            .saturating_add(self.confirm_timeout_per_message.saturating_mul(messages))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub batches: usize,
    pub events: usize,
}

/// Publishes events in chunks, each chunk as one confirmed operation.
#[async_trait]
pub trait EventPublisher<E>: Send + Sync {
    async fn publish_events(
        &self,
        events: &[E],
        exchange: &str,
        routing_key: &str,
    ) -> Result<PublishSummary, PublishError>;
}

pub struct BatchPublisher {
    connection: Arc<ConnectionManager>,
    topology: Topology,
    config: PublisherConfig,
}

impl BatchPublisher {
    pub fn new(
        connection: Arc<ConnectionManager>,
        topology: Topology,
        config: PublisherConfig,
    ) -> Self {
        Self {
            connection,
            topology,
            config,
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publishes all events on a fresh confirm-mode channel and waits until
    /// the broker confirmed every one of them. Transient failures retry the
    /// whole batch.
    pub async fn publish_batch<E: Serialize>(
        &self,
        events: &[E],
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), PublishError> {
        if events.is_empty() {
            return Ok(());
        }

        // Serialization errors are not retried, fail before any i/o
        let payloads = events
            .iter()
            .map(serde_json::to_vec)
            .collect::<Result<Vec<_>, _>>()?;
        let payloads = payloads.as_slice();
        let timeout = self.config.confirm_timeout(payloads.len());
        let started = Instant::now();

        retry(
            &self.config.retry,
            "publish_batch",
            AmqpError::is_transient,
            move |attempt| {
                debug!(attempt, size = payloads.len(), "publishing batch");
                self.try_publish(payloads, exchange, routing_key, timeout)
            },
        )
        .await
        .map_err(|source| {
            metrics::counter!("amqp_publisher_batch_failures").increment(1);
            PublishError::Broker {
                size: payloads.len(),
                source,
            }
        })?;

        metrics::counter!("amqp_publisher_batches_published").increment(1);
        metrics::counter!("amqp_publisher_messages_published").increment(payloads.len() as u64);
        metrics::histogram!("amqp_publisher_batch_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        info!(
            size = payloads.len(),
            exchange,
            routing_key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch published"
        );
        Ok(())
    }

    async fn try_publish(
        &self,
        payloads: &[Vec<u8>],
        exchange: &str,
        routing_key: &str,
        timeout: Duration,
    ) -> Result<(), AmqpError> {
        let channel = self.connection.create_channel().await?;
        let result = self
            .publish_on(&*channel, payloads, exchange, routing_key, timeout)
            .await;

        if let Err(err) = channel.close().await {
            debug!(error = %err, "failed to close publish channel");
        }
        result
    }

    async fn publish_on(
        &self,
        channel: &dyn BrokerChannel,
        payloads: &[Vec<u8>],
        exchange: &str,
        routing_key: &str,
        timeout: Duration,
    ) -> Result<(), AmqpError> {
        channel.enable_confirms().await?;
        self.topology.configure(channel).await?;

        let mut confirms = Vec::with_capacity(payloads.len());
        for payload in payloads {
            confirms.push(channel.publish(exchange, routing_key, payload).await?);
        }

        let confirmations = tokio::time::timeout(timeout, try_join_all(confirms))
            .await
            .map_err(|_| AmqpError::ConfirmTimeout(timeout))??;

        let nacked = confirmations
            .iter()
            .filter(|confirmation| **confirmation == Confirmation::Nack)
            .count();
        if nacked > 0 {
            return Err(AmqpError::Nacked(nacked));
        }
        Ok(())
    }
}

#[async_trait]
impl<E> EventPublisher<E> for BatchPublisher
where
    E: Serialize + Sync,
{
    async fn publish_events(
        &self,
        events: &[E],
        exchange: &str,
        routing_key: &str,
    ) -> Result<PublishSummary, PublishError> {
        let mut summary = PublishSummary::default();
        for chunk in events.chunks(self.config.batch_size()) {
            self.publish_batch(chunk, exchange, routing_key).await?;
            summary.batches += 1;
            summary.events += chunk.len();
        }
        Ok(summary)
    }
}

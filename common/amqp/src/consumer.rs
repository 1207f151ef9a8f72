use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_retry::RetryPolicy;
use futures::StreamExt;
use health::HealthHandle;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerChannel, DeliveryStream};
use crate::connection::ConnectionManager;
use crate::error::AmqpError;
use crate::topology::Topology;

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub batch_size: usize,
    /// Longest time a batch stays open, counted from its first item.
    pub max_wait: Duration,
    pub prefetch_multiplier: usize,
    pub buffer_multiplier: usize,
    pub reconnect: RetryPolicy,
    pub consumer_tag: String,
    /// How often the batching loop reports liveness while it waits.
    pub heartbeat: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_wait: Duration::from_secs(3),
            prefetch_multiplier: 3,
            buffer_multiplier: 10,
            reconnect: RetryPolicy::build(2, Duration::from_secs(2))
                .maximum_interval(Duration::from_secs(60))
                .unbounded()
                .provide(),
            consumer_tag: "batch-consumer".to_string(),
            heartbeat: Duration::from_secs(5),
        }
    }
}

impl ConsumerConfig {
    pub fn batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    /// Never zero, which the broker would read as unlimited.
    pub fn prefetch(&self) -> u16 {
        let prefetch = self
            .batch_size()
            .saturating_mul(self.prefetch_multiplier.max(1));
        u16::try_from(prefetch).unwrap_or(u16::MAX)
    }

    pub fn buffer_capacity(&self) -> usize {
        self.batch_size()
            .saturating_mul(self.buffer_multiplier)
            .max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem<T> {
    pub message: T,
    pub delivery_tag: u64,
}

/// Domain handling of a batch. The processor owns settlement: every delivery
/// tag of the batch must be acked, nacked or rejected on `channel`.
#[async_trait]
pub trait BatchProcessor<T>: Send + Sync {
    async fn process_batch(
        &self,
        batch: Vec<BatchItem<T>>,
        channel: Arc<dyn BrokerChannel>,
    ) -> Result<(), AmqpError>;
}

// A decoded delivery on its way to the batching loop. `subscription` counts
// (re)subscriptions, delivery tags are only meaningful on their own channel.
struct Buffered<T> {
    item: BatchItem<T>,
    channel: Arc<dyn BrokerChannel>,
    subscription: u64,
}

enum PumpExit {
    Shutdown,
    BufferClosed,
    Lost(String),
}

/// Consumes a queue and hands its messages to a processor in batches of up
/// to `batch_size`, or whatever arrived within `max_wait` of the first item.
///
/// Two loops run concurrently. Ingestion (re)subscribes, decodes deliveries
/// and pushes them into a bounded buffer, waiting when it is full. Batching
/// drains the buffer into batches and processes one batch at a time.
///
/// Liveness is reported by the batching loop only, so a processor that never
/// returns marks the consumer stalled even while deliveries keep arriving.
pub struct BatchConsumer<T, P> {
    connection: Arc<ConnectionManager>,
    topology: Topology,
    processor: P,
    config: ConsumerConfig,
    liveness: Option<HealthHandle>,
    _message: PhantomData<fn() -> T>,
}

impl<T, P> BatchConsumer<T, P>
where
    T: DeserializeOwned + Send + 'static,
    P: BatchProcessor<T>,
{
    pub fn new(
        connection: Arc<ConnectionManager>,
        topology: Topology,
        processor: P,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            connection,
            topology,
            processor,
            config,
            liveness: None,
            _message: PhantomData,
        }
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    /// Runs until `shutdown` flips to true. Buffered messages that were not
    /// processed yet stay unacknowledged and are redelivered by the broker.
    /// Only non-transient subscription errors end the consumer early.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), AmqpError> {
        let (buffer, items) = mpsc::channel(self.config.buffer_capacity());

        info!(
            queue = self.topology.queue,
            batch_size = self.config.batch_size(),
            max_wait_ms = self.config.max_wait.as_millis() as u64,
            prefetch = self.config.prefetch(),
            "starting batch consumer"
        );

        let (ingested, ()) = tokio::join!(
            self.ingest(buffer, shutdown.clone()),
            self.batch(items, shutdown)
        );

        info!(queue = self.topology.queue, "batch consumer stopped");
        ingested
    }

    async fn ingest(
        &self,
        buffer: mpsc::Sender<Buffered<T>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), AmqpError> {
        let mut attempt = 0;
        let mut subscription = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let subscribed = tokio::select! {
                subscribed = self.subscribe() => subscribed,
                _ = shutdown.changed() => return Ok(()),
            };

            let reason = match subscribed {
                Ok((channel, deliveries)) => {
                    attempt = 0;
                    subscription += 1;
                    info!(
                        queue = self.topology.queue,
                        channel = channel.id(),
                        subscription,
                        "subscribed to queue"
                    );
                    match self
                        .pump(channel, deliveries, subscription, &buffer, &mut shutdown)
                        .await
                    {
                        PumpExit::Shutdown | PumpExit::BufferClosed => return Ok(()),
                        PumpExit::Lost(reason) => reason,
                    }
                }
                Err(err) if err.is_transient() => err.to_string(),
                Err(err) => {
                    error!(queue = self.topology.queue, error = %err, "cannot subscribe to queue");
                    return Err(err);
                }
            };

            attempt += 1;
            let wait = self.config.reconnect.retry_interval(attempt);
            metrics::counter!("amqp_consumer_reconnects").increment(1);
            warn!(
                queue = self.topology.queue,
                attempt,
                wait_ms = wait.as_millis() as u64,
                reason = %reason,
                "subscription unavailable, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn subscribe(&self) -> Result<(Arc<dyn BrokerChannel>, DeliveryStream), AmqpError> {
        let channel = self.connection.create_channel().await?;

        let deliveries = async {
            self.topology.configure(&*channel).await?;
            channel.set_prefetch(self.config.prefetch()).await?;
            channel
                .consume(&self.topology.queue, &self.config.consumer_tag)
                .await
        }
        .await;

        match deliveries {
            Ok(deliveries) => Ok((channel, deliveries)),
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "failed to close channel after subscribe error");
                }
                Err(err)
            }
        }
    }

    async fn pump(
        &self,
        channel: Arc<dyn BrokerChannel>,
        mut deliveries: DeliveryStream,
        subscription: u64,
        buffer: &mpsc::Sender<Buffered<T>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> PumpExit {
        loop {
            let next = tokio::select! {
                next = deliveries.next() => next,
                _ = shutdown.changed() => return PumpExit::Shutdown,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => return PumpExit::Lost(err.to_string()),
                None => return PumpExit::Lost("delivery stream ended".to_string()),
            };
            metrics::counter!("amqp_consumer_messages_received").increment(1);

            // Empty bodies and `null` are as unusable as malformed JSON
            let message = match serde_json::from_slice::<Option<T>>(&delivery.data) {
                Ok(Some(message)) => message,
                Ok(None) => {
                    warn!(delivery_tag = delivery.delivery_tag, "null message, dead-lettering");
                    if let Err(err) = self.dead_letter(&*channel, delivery.delivery_tag).await {
                        return PumpExit::Lost(err.to_string());
                    }
                    continue;
                }
                Err(err) => {
                    warn!(
                        delivery_tag = delivery.delivery_tag,
                        redelivered = delivery.redelivered,
                        error = %err,
                        "undecodable message, dead-lettering"
                    );
                    if let Err(err) = self.dead_letter(&*channel, delivery.delivery_tag).await {
                        return PumpExit::Lost(err.to_string());
                    }
                    continue;
                }
            };

            let buffered = Buffered {
                item: BatchItem {
                    message,
                    delivery_tag: delivery.delivery_tag,
                },
                channel: channel.clone(),
                subscription,
            };

            tokio::select! {
                sent = buffer.send(buffered) => {
                    if sent.is_err() {
                        return PumpExit::BufferClosed;
                    }
                }
                _ = shutdown.changed() => return PumpExit::Shutdown,
            }
        }
    }

    async fn dead_letter(&self, channel: &dyn BrokerChannel, tag: u64) -> Result<(), AmqpError> {
        metrics::counter!("amqp_consumer_messages_rejected").increment(1);
        channel.reject(tag, false).await
    }

    async fn batch(&self, mut items: mpsc::Receiver<Buffered<T>>, mut shutdown: watch::Receiver<bool>) {
        let batch_size = self.config.batch_size();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First item of the next batch, when it closed the previous one early
        let mut carried: Option<Buffered<T>> = None;

        loop {
            let first = match carried.take() {
                Some(first) => first,
                None => {
                    if *shutdown.borrow() {
                        return;
                    }
                    tokio::select! {
                        next = items.recv() => match next {
                            Some(first) => first,
                            None => return,
                        },
                        _ = heartbeat.tick() => {
                            self.report_alive();
                            continue;
                        }
                        _ = shutdown.changed() => return,
                    }
                }
            };

            let deadline = Instant::now() + self.config.max_wait;
            let channel = first.channel;
            let subscription = first.subscription;
            let mut batch = Vec::with_capacity(batch_size);
            batch.push(first.item);
            let mut drained = false;

            while batch.len() < batch_size {
                tokio::select! {
                    next = tokio::time::timeout_at(deadline, items.recv()) => match next {
                        Ok(Some(item)) if item.subscription == subscription => batch.push(item.item),
                        // Never mix channels in a batch
                        Ok(Some(item)) => {
                            carried = Some(item);
                            break;
                        }
                        Ok(None) => {
                            drained = true;
                            break;
                        }
                        Err(_) => break,
                    },
                    _ = shutdown.changed() => return,
                }
            }

            self.flush(batch, channel).await;
            if drained {
                return;
            }
        }
    }

    async fn flush(&self, batch: Vec<BatchItem<T>>, channel: Arc<dyn BrokerChannel>) {
        let size = batch.len();

        if !channel.is_open() {
            // The broker requeued these when the channel went away
            metrics::counter!("amqp_consumer_batches_dropped").increment(1);
            warn!(size, channel = channel.id(), "channel closed, dropping batch for redelivery");
            return;
        }

        metrics::histogram!("amqp_consumer_batch_size").record(size as f64);
        let started = std::time::Instant::now();
        match self.processor.process_batch(batch, channel).await {
            Ok(()) => {
                metrics::counter!("amqp_consumer_batches_processed").increment(1);
                debug!(size, elapsed_ms = started.elapsed().as_millis() as u64, "batch processed");
            }
            Err(err) => {
                metrics::counter!("amqp_consumer_batch_errors").increment(1);
                error!(size, error = %err, "batch processing failed, unsettled messages will be redelivered");
            }
        }
        metrics::histogram!("amqp_consumer_batch_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        self.report_alive();
    }

    fn report_alive(&self) {
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
    }
}

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common_amqp::{
    AmqpError, BatchItem, BatchProcessor, BrokerChannel, ConnectionManager, ConsumerConfig,
    MemoryBroker, PublisherConfig, Topology,
};
use common_retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub const EXCHANGE: &str = "jobs-exchange";
pub const QUEUE: &str = "jobs-queue";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: u32,
}

pub fn topology() -> Topology {
    Topology::for_queue(EXCHANGE, QUEUE)
}

pub fn job_payload(id: u32) -> Vec<u8> {
    serde_json::to_vec(&Job { id }).unwrap()
}

pub fn manager(broker: &MemoryBroker) -> Arc<ConnectionManager> {
    ConnectionManager::new(Arc::new(broker.clone()))
}

/// Declares the test topology so messages can be routed before any consumer runs.
pub async fn declare(broker: &MemoryBroker) {
    let manager = manager(broker);
    let channel = manager.create_channel().await.unwrap();
    topology().configure(&*channel).await.unwrap();
    channel.close().await.unwrap();
    manager.dispose().await;
}

pub fn consumer_config(batch_size: usize, max_wait: Duration) -> ConsumerConfig {
    ConsumerConfig {
        batch_size,
        max_wait,
        reconnect: RetryPolicy::build(2, Duration::from_millis(10))
            .maximum_interval(Duration::from_millis(100))
            .unbounded()
            .provide(),
        consumer_tag: "test".to_string(),
        ..ConsumerConfig::default()
    }
}

pub fn publisher_config(batch_size: usize) -> PublisherConfig {
    PublisherConfig {
        publish_batch_size: batch_size,
        confirm_timeout_floor: Duration::from_secs(5),
        confirm_timeout_per_message: Duration::from_millis(1),
        retry: RetryPolicy::build(2, Duration::from_millis(1))
            .max_attempts(3)
            .provide(),
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedBatch {
    pub ids: Vec<u32>,
    pub channel: u64,
}

/// Acks every item and reports each batch it saw.
#[derive(Clone)]
pub struct RecordingProcessor {
    batches: Arc<Mutex<Vec<ProcessedBatch>>>,
    notify: mpsc::UnboundedSender<ProcessedBatch>,
}

impl RecordingProcessor {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProcessedBatch>) {
        let (notify, receiver) = mpsc::unbounded_channel();
        (
            Self {
                batches: Default::default(),
                notify,
            },
            receiver,
        )
    }

    pub fn batches(&self) -> Vec<ProcessedBatch> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchProcessor<Job> for RecordingProcessor {
    async fn process_batch(
        &self,
        batch: Vec<BatchItem<Job>>,
        channel: Arc<dyn BrokerChannel>,
    ) -> Result<(), AmqpError> {
        for item in &batch {
            channel.ack(item.delivery_tag, false).await?;
        }

        let processed = ProcessedBatch {
            ids: batch.iter().map(|item| item.message.id).collect(),
            channel: channel.id(),
        };
        self.batches.lock().unwrap().push(processed.clone());
        self.notify.send(processed).ok();
        Ok(())
    }
}

/// Polls `condition` until it holds, failing the test after `timeout`.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

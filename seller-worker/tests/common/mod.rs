#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common_amqp::{
    AmqpError, BatchConsumer, ConnectionManager, ConsumerConfig, MemoryBroker, Topology,
};
use common_retry::RetryPolicy;
use common_types::topology::{SELLER_CREATION_QUEUE, SELLER_EXCHANGE};
use common_types::{Seller, SellerCreatedEvent};
use seller_worker::processor::SellerBatchProcessor;
use seller_worker::store::MemoryStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const MAX_BATCH_ATTEMPTS: u32 = 3;

pub fn topology() -> Topology {
    Topology::for_queue(SELLER_EXCHANGE, SELLER_CREATION_QUEUE)
}

pub fn event(n: u32) -> SellerCreatedEvent {
    SellerCreatedEvent {
        id: Uuid::now_v7(),
        first_name: format!("First{n}"),
        last_name: format!("Last{n}"),
        email: email(n),
        phone_number: format!("555-{n:04}"),
        region: "EU".to_string(),
        is_active: true,
        created_at: DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc),
    }
}

pub fn email(n: u32) -> String {
    format!("seller-{n}@example.com")
}

pub fn seller(n: u32) -> Seller {
    Seller::import(&event(n)).unwrap()
}

pub fn publish(broker: &MemoryBroker, event: &SellerCreatedEvent) {
    let payload = serde_json::to_vec(event).unwrap();
    broker.publish_raw(SELLER_EXCHANGE, SELLER_CREATION_QUEUE, &payload);
}

pub fn manager(broker: &MemoryBroker) -> Arc<ConnectionManager> {
    ConnectionManager::new(Arc::new(broker.clone()))
}

/// Declares the seller topology so events can be routed before the worker runs.
pub async fn declare(broker: &MemoryBroker) {
    let manager = manager(broker);
    let channel = manager.create_channel().await.unwrap();
    topology().configure(&*channel).await.unwrap();
    channel.close().await.unwrap();
    manager.dispose().await;
}

fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        batch_size: 10,
        max_wait: Duration::from_millis(20),
        reconnect: RetryPolicy::build(2, Duration::from_millis(10))
            .maximum_interval(Duration::from_millis(100))
            .unbounded()
            .provide(),
        consumer_tag: "seller-worker-test".to_string(),
        ..ConsumerConfig::default()
    }
}

pub struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<(), AmqpError>>,
    connection: Arc<ConnectionManager>,
}

impl Worker {
    /// Runs the seller consumer against `broker`, persisting into `store`.
    pub fn start(broker: &MemoryBroker, store: &MemoryStore) -> Worker {
        let connection = manager(broker);
        let processor = SellerBatchProcessor::new(
            store.clone(),
            RetryPolicy::build(2, Duration::from_millis(1))
                .max_attempts(3)
                .provide(),
            MAX_BATCH_ATTEMPTS,
        );
        let consumer = BatchConsumer::<SellerCreatedEvent, _>::new(
            connection.clone(),
            topology(),
            processor,
            consumer_config(),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { consumer.run(shutdown_rx).await });

        Worker {
            shutdown,
            handle,
            connection,
        }
    }

    pub async fn stop(self) {
        self.shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("worker did not stop")
            .unwrap()
            .unwrap();
        self.connection.dispose().await;
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

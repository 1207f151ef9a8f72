//! Seams between the messaging pipeline and an AMQP client. The lapin adapter
//! in `rabbitmq` talks to a real broker, `memory` simulates one in-process.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::AmqpError;

/// Invoked by a connection when the broker reports it failed. Must not block.
pub type FailureCallback = Box<dyn Fn(String) + Send + Sync>;

/// Resolves once the broker confirmed (or refused) a published message.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, AmqpError>>;

/// Deliveries of a subscription. The stream ends, or yields an error, when
/// the subscription is lost.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub redelivered: bool,
}

/// Where a queue sends messages rejected without requeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    pub routing_key: String,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    fn on_failure(&self, callback: FailureCallback);

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u64;

    fn is_open(&self) -> bool;

    /// Declares a durable direct exchange.
    async fn declare_exchange(&self, name: &str) -> Result<(), AmqpError>;

    /// Declares a durable, non-exclusive, non-auto-delete queue.
    async fn declare_queue(
        &self,
        name: &str,
        dead_letter: Option<&DeadLetter>,
    ) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    async fn enable_confirms(&self) -> Result<(), AmqpError>;

    /// Publishes a persistent `application/json` message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<PendingConfirm, AmqpError>;

    /// Starts a manual-ack subscription.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool)
        -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm;
use lapin::types::{AMQPValue, FieldTable};
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, ConnectionProperties, ExchangeKind};

use crate::broker::{
    BrokerChannel, BrokerConnection, Confirmation, Connector, DeadLetter, Delivery,
    DeliveryStream, FailureCallback, PendingConfirm,
};
use crate::error::AmqpError;

const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
const DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
const PERSISTENT: u8 = 2;

impl From<lapin::Error> for AmqpError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(e) => AmqpError::Io(e.to_string()),
            lapin::Error::InvalidChannelState(_) => AmqpError::ChannelClosed,
            lapin::Error::InvalidConnectionState(state) => {
                AmqpError::ConnectionClosed(format!("{state:?}"))
            }
            other => AmqpError::Protocol(other.to_string()),
        }
    }
}

pub struct LapinConnector {
    uri: AMQPUri,
}

impl LapinConnector {
    pub fn new(uri: AMQPUri) -> Self {
        Self { uri }
    }
}

/// Runs lapin's tasks and socket I/O on the current tokio runtime.
fn connection_properties() -> ConnectionProperties {
    ConnectionProperties::default()
        .with_executor(tokio_executor_trait::Tokio::current())
        .with_reactor(tokio_reactor_trait::Tokio)
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let connection =
            lapin::Connection::connect_uri(self.uri.clone(), connection_properties()).await?;
        Ok(Arc::new(LapinConnection { inner: connection }))
    }
}

struct LapinConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_failure(&self, callback: FailureCallback) {
        self.inner.on_error(move |err| callback(err.to_string()));
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(LapinChannel { inner: channel }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close(200, "OK").await?;
        Ok(())
    }
}

struct LapinChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u64 {
        u64::from(self.inner.id())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.inner
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        dead_letter: Option<&DeadLetter>,
    ) -> Result<(), AmqpError> {
        let mut arguments = FieldTable::default();
        if let Some(dead_letter) = dead_letter {
            arguments.insert(
                DEAD_LETTER_EXCHANGE.into(),
                AMQPValue::LongString(dead_letter.exchange.as_str().into()),
            );
            arguments.insert(
                DEAD_LETTER_ROUTING_KEY.into(),
                AMQPValue::LongString(dead_letter.routing_key.as_str().into()),
            );
        }

        self.inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<(), AmqpError> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<PendingConfirm, AmqpError> {
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await?;

        Ok(Box::pin(async move {
            match confirm.await? {
                publisher_confirm::Confirmation::Nack(_) => Ok(Confirmation::Nack),
                _ => Ok(Confirmation::Ack),
            }
        }))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|d| Delivery {
                        delivery_tag: d.delivery_tag,
                        data: d.data,
                        redelivered: d.redelivered,
                    })
                    .map_err(AmqpError::from)
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await?;
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.inner
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.inner.status().connected() {
            self.inner.close(200, "OK").await?;
        }
        Ok(())
    }
}

//! An in-process broker with enough AMQP semantics for the pipeline: durable
//! direct exchanges, queues with dead-letter arguments, prefetch, manual
//! acknowledgements, publisher confirms and redelivery of unacknowledged
//! messages when a channel or connection goes away. It also lets callers
//! inject connection failures, publish failures and negative confirms.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;

use crate::broker::{
    BrokerChannel, BrokerConnection, Confirmation, Connector, DeadLetter, Delivery,
    DeliveryStream, FailureCallback, PendingConfirm,
};
use crate::error::AmqpError;

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

#[derive(Debug, Clone)]
struct Message {
    data: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    messages: VecDeque<Message>,
    dead_letter: Option<DeadLetter>,
    consumers: Vec<u64>,
    next_consumer: usize,
}

struct ConnectionState {
    open: bool,
    callbacks: Vec<Arc<FailureCallback>>,
}

struct ChannelState {
    connection: u64,
    open: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, Message)>,
    consumer: Option<(String, DeliverySender)>,
}

#[derive(Default)]
struct Faults {
    failing_connects: usize,
    unreachable: bool,
    failing_publishes: usize,
    nacked_publishes: usize,
    confirm_delay: Option<Duration>,
}

#[derive(Default)]
struct BrokerState {
    // exchange -> (queue, routing key) bindings
    exchanges: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<u64, ChannelState>,
    next_id: u64,
    faults: Faults,
    connects: usize,
    protocol_errors: usize,
    // channel id -> messages published on it
    published: BTreeMap<u64, usize>,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().faults.failing_connects = count;
    }

    /// While set, every connection attempt fails.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().faults.unreachable = unreachable;
    }

    /// The next `count` publishes fail with an i/o error.
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().faults.failing_publishes = count;
    }

    /// The next `count` published messages are negatively confirmed and dropped.
    pub fn nack_next_publishes(&self, count: usize) {
        self.lock().faults.nacked_publishes = count;
    }

    pub fn delay_confirms(&self, delay: Option<Duration>) {
        self.lock().faults.confirm_delay = delay;
    }

    /// Kills every open connection, as a broker restart would. Unacknowledged
    /// messages go back to their queues and failure callbacks are invoked.
    pub fn drop_connections(&self) {
        let callbacks = {
            let mut state = self.lock();
            let ids: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, conn)| conn.open)
                .map(|(id, _)| *id)
                .collect();

            let mut callbacks = Vec::new();
            for id in ids {
                callbacks.extend(state.close_connection(id, true));
            }
            state.dispatch();
            callbacks
        };

        for callback in callbacks {
            callback("connection reset by broker".to_string());
        }
    }

    /// Routes a raw payload as if published, without a channel or confirms.
    pub fn publish_raw(&self, exchange: &str, routing_key: &str, payload: &[u8]) {
        let mut state = self.lock();
        state.route(
            exchange,
            routing_key,
            Message {
                data: payload.to_vec(),
                redelivered: false,
            },
        );
        state.dispatch();
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    /// Ready (not delivered) messages of a queue, oldest first.
    pub fn queue_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.data.clone()).collect())
            .unwrap_or_default()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn queue_dead_letter(&self, queue: &str) -> Option<DeadLetter> {
        self.lock()
            .queues
            .get(queue)
            .and_then(|q| q.dead_letter.clone())
    }

    pub fn exchange_bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.lock()
            .exchanges
            .get(exchange)
            .cloned()
            .unwrap_or_default()
    }

    pub fn unacked_count(&self) -> usize {
        self.lock()
            .channels
            .values()
            .map(|c| c.unacked.len())
            .sum()
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn open_connections(&self) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|c| c.open)
            .count()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.values().filter(|c| c.open).count()
    }

    /// Acknowledgements of unknown delivery tags, which close the channel on
    /// a real broker.
    pub fn protocol_errors(&self) -> usize {
        self.lock().protocol_errors
    }

    /// Number of messages published per channel, in channel creation order.
    pub fn published_batches(&self) -> Vec<usize> {
        self.lock().published.values().copied().collect()
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&mut self, exchange: &str, routing_key: &str, message: Message) {
        // The default exchange routes to the queue named by the routing key
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            self.exchanges
                .get(exchange)
                .map(|bindings| {
                    bindings
                        .iter()
                        .filter(|(_, key)| key == routing_key)
                        .map(|(queue, _)| queue.clone())
                        .collect()
                })
                .unwrap_or_default()
        };

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.messages.push_back(message.clone());
            }
        }
    }

    fn dead_letter(&mut self, queue: &str, mut message: Message) {
        let Some(dead_letter) = self.queues.get(queue).and_then(|q| q.dead_letter.clone()) else {
            return;
        };
        message.redelivered = false;
        self.route(&dead_letter.exchange, &dead_letter.routing_key, message);
    }

    fn dispatch(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            loop {
                let Some(queue) = self.queues.get_mut(&name) else {
                    break;
                };
                if queue.messages.is_empty() || queue.consumers.is_empty() {
                    break;
                }

                // Round-robin over consumers with prefetch room
                let count = queue.consumers.len();
                let mut chosen = None;
                for offset in 0..count {
                    let index = (queue.next_consumer + offset) % count;
                    let id = queue.consumers[index];
                    if let Some(channel) = self.channels.get(&id) {
                        let has_room = channel.prefetch == 0
                            || channel.unacked.len() < usize::from(channel.prefetch);
                        if channel.open && has_room {
                            chosen = Some((index, id));
                            break;
                        }
                    }
                }
                let Some((index, id)) = chosen else {
                    break;
                };
                queue.next_consumer = (index + 1) % count;
                let Some(message) = queue.messages.pop_front() else {
                    break;
                };

                let Some(channel) = self.channels.get_mut(&id) else {
                    break;
                };
                channel.next_tag += 1;
                let tag = channel.next_tag;
                let delivery = Delivery {
                    delivery_tag: tag,
                    data: message.data.clone(),
                    redelivered: message.redelivered,
                };
                let delivered = match &channel.consumer {
                    Some((_, sender)) => sender.unbounded_send(Ok(delivery)).is_ok(),
                    None => false,
                };

                if delivered {
                    channel.unacked.insert(tag, (name.clone(), message));
                } else {
                    // Subscriber went away, stop feeding it
                    channel.consumer = None;
                    if let Some(queue) = self.queues.get_mut(&name) {
                        queue.messages.push_front(message);
                        queue.consumers.retain(|c| *c != id);
                    }
                }
            }
        }
    }

    fn requeue(&mut self, unacked: BTreeMap<u64, (String, Message)>) {
        // Newest first, so the oldest ends up at the head of its queue
        for (_, (queue, mut message)) in unacked.into_iter().rev() {
            message.redelivered = true;
            if let Some(queue) = self.queues.get_mut(&queue) {
                queue.messages.push_front(message);
            }
        }
    }

    fn close_channel(&mut self, id: u64, error: Option<AmqpError>) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        let unacked = std::mem::take(&mut channel.unacked);
        if let Some((queue, sender)) = channel.consumer.take() {
            if let Some(error) = error {
                if sender.unbounded_send(Err(error)).is_err() {
                    tracing::debug!(channel = id, "consumer already gone");
                }
            }
            if let Some(queue) = self.queues.get_mut(&queue) {
                queue.consumers.retain(|c| *c != id);
            }
        }
        self.requeue(unacked);
    }

    fn close_connection(&mut self, id: u64, failed: bool) -> Vec<Arc<FailureCallback>> {
        let Some(connection) = self.connections.get_mut(&id) else {
            return Vec::new();
        };
        if !connection.open {
            return Vec::new();
        }
        connection.open = false;
        let callbacks = if failed {
            connection.callbacks.clone()
        } else {
            Vec::new()
        };

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == id)
            .map(|(cid, _)| *cid)
            .collect();
        for channel in channels {
            let error = failed.then(|| AmqpError::ConnectionClosed("connection reset".to_string()));
            self.close_channel(channel, error);
        }
        callbacks
    }

    fn channel(&mut self, id: u64) -> Result<&mut ChannelState, AmqpError> {
        match self.channels.get_mut(&id) {
            Some(channel) if channel.open => Ok(channel),
            _ => Err(AmqpError::ChannelClosed),
        }
    }

    /// A channel-level protocol error closes the channel, as on a real broker.
    fn channel_error(&mut self, id: u64, reason: String) -> AmqpError {
        self.protocol_errors += 1;
        self.close_channel(id, Some(AmqpError::Protocol(reason.clone())));
        self.dispatch();
        AmqpError::Protocol(reason)
    }

    fn settle(&mut self, id: u64, tag: u64, multiple: bool) -> Result<Vec<(String, Message)>, AmqpError> {
        let channel = self.channel(id)?;
        if !channel.unacked.contains_key(&tag) {
            return Err(self.channel_error(id, format!("PRECONDITION_FAILED - unknown delivery tag {tag}")));
        }
        let settled = if multiple {
            let rest = channel.unacked.split_off(&(tag + 1));
            std::mem::replace(&mut channel.unacked, rest)
                .into_values()
                .collect()
        } else {
            channel.unacked.remove(&tag).into_iter().collect()
        };
        Ok(settled)
    }

    fn reject_settled(&mut self, settled: Vec<(String, Message)>, requeue: bool) {
        if requeue {
            let unacked = settled
                .into_iter()
                .enumerate()
                .map(|(i, entry)| (i as u64, entry))
                .collect();
            self.requeue(unacked);
        } else {
            for (queue, message) in settled {
                self.dead_letter(&queue, message);
            }
        }
        self.dispatch();
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.lock();
        state.connects += 1;
        if state.faults.unreachable {
            return Err(AmqpError::Io("connection refused".to_string()));
        }
        if state.faults.failing_connects > 0 {
            state.faults.failing_connects -= 1;
            return Err(AmqpError::Io("connection refused".to_string()));
        }

        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                callbacks: Vec::new(),
            },
        );
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.broker
            .lock()
            .connections
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    fn on_failure(&self, callback: FailureCallback) {
        if let Some(connection) = self.broker.lock().connections.get_mut(&self.id) {
            connection.callbacks.push(Arc::new(callback));
        }
    }

    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let mut state = self.broker.lock();
        if !state.connections.get(&self.id).is_some_and(|c| c.open) {
            return Err(AmqpError::ConnectionClosed("connection is closed".to_string()));
        }
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                consumer: None,
            },
        );
        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.close_connection(self.id, false);
        state.dispatch();
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.broker
            .lock()
            .channels
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        state.exchanges.entry(name.to_owned()).or_default();
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        dead_letter: Option<&DeadLetter>,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        if let Some(existing) = state.queues.get(name) {
            if existing.dead_letter.as_ref() != dead_letter {
                return Err(state.channel_error(
                    self.id,
                    format!("PRECONDITION_FAILED - inequivalent arguments for queue '{name}'"),
                ));
            }
            return Ok(());
        }
        state.queues.insert(
            name.to_owned(),
            QueueState {
                dead_letter: dead_letter.cloned(),
                ..QueueState::default()
            },
        );
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(state.channel_error(self.id, format!("NOT_FOUND - no queue '{queue}'")));
        }
        let Some(bindings) = state.exchanges.get_mut(exchange) else {
            return Err(state.channel_error(self.id, format!("NOT_FOUND - no exchange '{exchange}'")));
        };
        let binding = (queue.to_owned(), routing_key.to_owned());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?.prefetch = count;
        state.dispatch();
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<(), AmqpError> {
        self.broker.lock().channel(self.id).map(|_| ())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<PendingConfirm, AmqpError> {
        let (confirmation, delay) = {
            let mut state = self.broker.lock();
            state.channel(self.id)?;
            if state.faults.failing_publishes > 0 {
                state.faults.failing_publishes -= 1;
                return Err(AmqpError::Io("broken pipe".to_string()));
            }
            if !exchange.is_empty() && !state.exchanges.contains_key(exchange) {
                return Err(state.channel_error(self.id, format!("NOT_FOUND - no exchange '{exchange}'")));
            }

            *state.published.entry(self.id).or_default() += 1;
            let confirmation = if state.faults.nacked_publishes > 0 {
                state.faults.nacked_publishes -= 1;
                Confirmation::Nack
            } else {
                state.route(
                    exchange,
                    routing_key,
                    Message {
                        data: payload.to_vec(),
                        redelivered: false,
                    },
                );
                state.dispatch();
                Confirmation::Ack
            };
            (confirmation, state.faults.confirm_delay)
        };

        Ok(Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(confirmation)
        }))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.broker.lock();
        state.channel(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(state.channel_error(self.id, format!("NOT_FOUND - no queue '{queue}'")));
        }

        let (sender, receiver) = mpsc::unbounded();
        if let Ok(channel) = state.channel(self.id) {
            channel.consumer = Some((queue.to_owned(), sender));
        }
        if let Some(queue) = state.queues.get_mut(queue) {
            queue.consumers.push(self.id);
        }
        tracing::debug!(channel = self.id, consumer_tag, "memory consumer registered");
        state.dispatch();

        Ok(receiver.boxed())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.settle(self.id, delivery_tag, multiple)?;
        state.dispatch();
        Ok(())
    }

    async fn nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let settled = state.settle(self.id, delivery_tag, multiple)?;
        state.reject_settled(settled, requeue);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let settled = state.settle(self.id, delivery_tag, false)?;
        state.reject_settled(settled, requeue);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.close_channel(self.id, None);
        state.dispatch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
        let connection = broker.connect().await.unwrap();
        connection.create_channel().await.unwrap()
    }

    async fn declare(channel: &dyn BrokerChannel) {
        channel.declare_exchange("dlx").await.unwrap();
        channel.declare_queue("dlq", None).await.unwrap();
        channel.bind_queue("dlq", "dlx", "dlq").await.unwrap();
        channel.declare_exchange("ex").await.unwrap();
        let dead_letter = DeadLetter {
            exchange: "dlx".to_string(),
            routing_key: "dlq".to_string(),
        };
        channel.declare_queue("q", Some(&dead_letter)).await.unwrap();
        channel.bind_queue("q", "ex", "q").await.unwrap();
    }

    #[tokio::test]
    async fn test_prefetch_limits_deliveries() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        declare(&*channel).await;
        for i in 0..5 {
            broker.publish_raw("ex", "q", format!("{i}").as_bytes());
        }

        channel.set_prefetch(2).await.unwrap();
        let mut deliveries = channel.consume("q", "test").await.unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.data, b"0");
        assert_eq!(second.data, b"1");
        assert_eq!(broker.queue_len("q"), 3);

        channel.ack(second.delivery_tag, true).await.unwrap();
        assert_eq!(broker.queue_len("q"), 1);
        assert_eq!(broker.unacked_count(), 2);
    }

    #[tokio::test]
    async fn test_reject_without_requeue_dead_letters() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        declare(&*channel).await;
        broker.publish_raw("ex", "q", b"poison");

        let mut deliveries = channel.consume("q", "test").await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        channel.reject(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.queue_len("q"), 0);
        assert_eq!(broker.queue_messages("dlq"), vec![b"poison".to_vec()]);
    }

    #[tokio::test]
    async fn test_closed_channel_requeues_unacked() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        declare(&*channel).await;
        broker.publish_raw("ex", "q", b"a");
        broker.publish_raw("ex", "q", b"b");

        let mut deliveries = channel.consume("q", "test").await.unwrap();
        assert!(deliveries.next().await.is_some());
        assert!(deliveries.next().await.is_some());
        channel.close().await.unwrap();

        assert_eq!(broker.queue_messages("q"), vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(deliveries.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_tag_closes_channel() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        declare(&*channel).await;

        let err = channel.ack(42, false).await.unwrap_err();
        assert!(matches!(err, AmqpError::Protocol(_)));
        assert!(!channel.is_open());
        assert_eq!(broker.protocol_errors(), 1);
    }

    #[tokio::test]
    async fn test_protocol_error_after_consumer_went_away() {
        let broker = MemoryBroker::new();
        let channel = channel(&broker).await;
        declare(&*channel).await;
        broker.publish_raw("ex", "q", b"a");

        let mut deliveries = channel.consume("q", "test").await.unwrap();
        assert!(deliveries.next().await.is_some());
        drop(deliveries);

        assert!(channel.ack(42, false).await.is_err());
        assert!(!channel.is_open());
        assert_eq!(broker.queue_messages("q"), vec![b"a".to_vec()]);
    }

    #[tokio::test]
    async fn test_dropped_connection_notifies() {
        let broker = MemoryBroker::new();
        let connection = broker.connect().await.unwrap();
        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        connection.on_failure(Box::new(move |reason| {
            sender.send(reason).unwrap();
        }));

        broker.drop_connections();

        assert!(!connection.is_connected());
        assert!(receiver.recv().await.is_some());
    }
}

use tracing::debug;

use crate::broker::{BrokerChannel, DeadLetter};
use crate::error::AmqpError;

/// A primary exchange and queue, plus the dead-letter pair receiving what the
/// primary queue rejects without requeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub dead_letter_routing_key: String,
}

impl Topology {
    /// Derives every name from the primary exchange and queue: routing keys
    /// are the queue names, dead-letter names get `.dlx` and `.dlq` suffixes.
    pub fn for_queue(exchange: &str, queue: &str) -> Self {
        let dead_letter_queue = format!("{queue}.dlq");
        Self {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_key: queue.to_owned(),
            dead_letter_exchange: format!("{exchange}.dlx"),
            dead_letter_routing_key: dead_letter_queue.clone(),
            dead_letter_queue,
        }
    }

    pub fn dead_letter(&self) -> DeadLetter {
        DeadLetter {
            exchange: self.dead_letter_exchange.clone(),
            routing_key: self.dead_letter_routing_key.clone(),
        }
    }

    /// Declares everything on `channel`. Safe to call on every new channel,
    /// redeclaring with identical arguments is a no-op on the broker.
    pub async fn configure(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        channel.declare_exchange(&self.dead_letter_exchange).await?;
        channel.declare_queue(&self.dead_letter_queue, None).await?;
        channel
            .bind_queue(
                &self.dead_letter_queue,
                &self.dead_letter_exchange,
                &self.dead_letter_routing_key,
            )
            .await?;

        channel.declare_exchange(&self.exchange).await?;
        channel
            .declare_queue(&self.queue, Some(&self.dead_letter()))
            .await?;
        channel
            .bind_queue(&self.queue, &self.exchange, &self.routing_key)
            .await?;

        debug!(
            channel = channel.id(),
            exchange = self.exchange,
            queue = self.queue,
            "topology configured"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_naming_convention() {
        let topology = Topology::for_queue("seller-exchange", "seller-creation-queue");

        assert_eq!(topology.routing_key, "seller-creation-queue");
        assert_eq!(topology.dead_letter_exchange, "seller-exchange.dlx");
        assert_eq!(topology.dead_letter_queue, "seller-creation-queue.dlq");
        assert_eq!(topology.dead_letter_routing_key, "seller-creation-queue.dlq");
    }
}

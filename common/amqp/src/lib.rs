pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod publisher;
pub mod rabbitmq;
pub mod topology;

pub use broker::{BrokerChannel, Confirmation, Connector, DeadLetter, Delivery};
pub use config::{AmqpConfig, EnvMsDuration};
pub use connection::{ConnectionManager, ConnectionStatus};
pub use consumer::{BatchConsumer, BatchItem, BatchProcessor, ConsumerConfig};
pub use error::{AmqpError, PublishError};
pub use memory::MemoryBroker;
pub use publisher::{BatchPublisher, EventPublisher, PublishSummary, PublisherConfig};
pub use rabbitmq::LapinConnector;
pub use topology::Topology;

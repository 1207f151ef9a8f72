//! Broker names used by the seller ingestion pipeline. The dead-letter names
//! follow the `{exchange}.dlx` / `{queue}.dlq` convention.

pub const SELLER_EXCHANGE: &str = "seller-exchange";
pub const SELLER_CREATION_QUEUE: &str = "seller-creation-queue";
pub const SELLER_ROUTING_KEY: &str = SELLER_CREATION_QUEUE;

pub const SELLER_DL_EXCHANGE: &str = "seller-exchange.dlx";
pub const SELLER_DL_QUEUE: &str = "seller-creation-queue.dlq";
pub const SELLER_DL_ROUTING_KEY: &str = SELLER_DL_QUEUE;

use std::num::ParseIntError;
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

use common_retry::RetryPolicy;
use envconfig::Envconfig;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};

use crate::consumer::ConsumerConfig;
use crate::publisher::PublisherConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvMsDuration(pub Duration);

impl FromStr for EnvMsDuration {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.trim().parse::<u64>()?;
        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}

impl Deref for EnvMsDuration {
    type Target = Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct AmqpConfig {
    #[envconfig(default = "localhost")]
    pub amqp_host: String,

    #[envconfig(default = "5672")]
    pub amqp_port: u16,

    #[envconfig(default = "guest")]
    pub amqp_username: String,

    #[envconfig(default = "guest")]
    pub amqp_password: String,

    #[envconfig(default = "/")]
    pub amqp_vhost: String,

    #[envconfig(default = "5000")]
    pub amqp_publish_batch_size: usize, // Events per confirmed publish operation

    #[envconfig(default = "1000")]
    pub amqp_consumer_batch_size: usize,

    #[envconfig(default = "3000")]
    pub amqp_max_wait_time_ms: EnvMsDuration, // Window for filling a batch, from its first item

    #[envconfig(default = "3")]
    pub amqp_prefetch_multiplier: usize, // prefetch = batch size * multiplier

    #[envconfig(default = "10")]
    pub amqp_buffer_multiplier: usize, // buffered deliveries = batch size * multiplier

    #[envconfig(default = "10000")]
    pub amqp_confirm_timeout_floor_ms: EnvMsDuration,

    #[envconfig(default = "2")]
    pub amqp_confirm_timeout_per_message_ms: EnvMsDuration,

    #[envconfig(default = "3")]
    pub amqp_publish_max_attempts: u32,

    #[envconfig(default = "1000")]
    pub amqp_publish_retry_initial_ms: EnvMsDuration,

    #[envconfig(default = "2000")]
    pub amqp_reconnect_initial_ms: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub amqp_reconnect_max_ms: EnvMsDuration,
}

impl AmqpConfig {
    /// Broker address built field by field, credentials and vhost are never
    /// parsed out of a URI string.
    pub fn uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.amqp_username.clone(),
                    password: self.amqp_password.clone(),
                },
                host: self.amqp_host.clone(),
                port: self.amqp_port,
            },
            vhost: self.amqp_vhost.clone(),
            ..AMQPUri::default()
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            publish_batch_size: self.amqp_publish_batch_size,
            confirm_timeout_floor: *self.amqp_confirm_timeout_floor_ms,
            confirm_timeout_per_message: *self.amqp_confirm_timeout_per_message_ms,
            retry: RetryPolicy::build(2, *self.amqp_publish_retry_initial_ms)
                .max_attempts(self.amqp_publish_max_attempts)
                .provide(),
        }
    }

    pub fn consumer_config(&self, consumer_tag: &str) -> ConsumerConfig {
        ConsumerConfig {
            batch_size: self.amqp_consumer_batch_size,
            max_wait: *self.amqp_max_wait_time_ms,
            prefetch_multiplier: self.amqp_prefetch_multiplier,
            buffer_multiplier: self.amqp_buffer_multiplier,
            reconnect: RetryPolicy::build(2, *self.amqp_reconnect_initial_ms)
                .maximum_interval(*self.amqp_reconnect_max_ms)
                .unbounded()
                .provide(),
            consumer_tag: consumer_tag.to_owned(),
            ..ConsumerConfig::default()
        }
    }
}

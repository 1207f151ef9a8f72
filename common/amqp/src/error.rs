use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AmqpError {
    #[error("broker connection is not available: {0}")]
    ConnectionUnavailable(String),

    #[error("broker connection closed: {0}")]
    ConnectionClosed(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("broker i/o error: {0}")]
    Io(String),

    #[error("timed out after {0:?} waiting for publisher confirms")]
    ConfirmTimeout(Duration),

    #[error("broker negatively confirmed {0} messages")]
    Nacked(usize),

    #[error("broker protocol error: {0}")]
    Protocol(String),

    #[error("connection manager has been disposed")]
    Disposed,
}

impl AmqpError {
    /// Errors worth retrying: the broker may accept the same operation later.
    /// A negative confirm is not, the broker explicitly refused the messages.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionUnavailable(_)
                | AmqpError::ConnectionClosed(_)
                | AmqpError::ChannelClosed
                | AmqpError::Io(_)
                | AmqpError::ConfirmTimeout(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to publish batch of {size} events: {source}")]
    Broker {
        size: usize,
        #[source]
        source: AmqpError,
    },
}

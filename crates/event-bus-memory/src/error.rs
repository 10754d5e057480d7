use event_bus::transport::TransportError;
use thiserror::Error;

/// Errors raised by the in-memory broker.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// The broker refuses connections.
    #[error("broker unreachable")]
    Unreachable,

    /// The broker rejected the credentials.
    #[error("access refused")]
    AccessRefused,

    /// The connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The channel was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// An injected publish failure.
    #[error("publish failed")]
    PublishFailed,

    /// No exchange with this name was declared.
    #[error("exchange `{0}` not found")]
    ExchangeNotFound(String),

    /// No queue with this name was declared.
    #[error("queue `{0}` not found")]
    QueueNotFound(String),

    /// The queue exists with different arguments.
    #[error("queue `{0}` redeclared with different arguments")]
    PreconditionFailed(String),

    /// The consumer tag is taken on this channel.
    #[error("consumer tag `{0}` already in use")]
    DuplicateConsumer(String),

    /// The delivery was already settled or returned to its queue.
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),
}

impl TransportError for Error {
    fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable | Self::ConnectionClosed | Self::ChannelClosed | Self::PublishFailed
        )
    }
}

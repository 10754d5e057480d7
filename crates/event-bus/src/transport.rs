use std::error::Error;
use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::BoxError;

/// Error raised by a broker backend.
pub trait TransportError: Error + Send + Sync + 'static {
    /// Whether the failure is transient network or broker unavailability.
    fn is_retriable(&self) -> bool;
}

/// Unsolicited connection events that trigger a reconnect.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionSignal {
    /// The broker or network closed the connection.
    Shutdown,

    /// The broker blocked the connection (resource alarm).
    Blocked,

    /// A client callback raised an error.
    Error(String),
}

/// Callback invoked for each [`ConnectionSignal`].
pub type SignalHandler = Arc<dyn Fn(ConnectionSignal) + Send + Sync>;

/// Opens broker connections.
#[async_trait]
pub trait Connector
where
    Self: Send + Sync + 'static,
{
    /// The error type for the connector.
    type Error: TransportError;

    /// The connection type produced.
    type Connection: BrokerConnection;

    /// Opens a new connection.
    async fn connect(&self) -> Result<Self::Connection, Self::Error>;
}

/// Channel type of the connections a connector produces.
pub type ChannelOf<C> = <<C as Connector>::Connection as BrokerConnection>::Channel;

/// A live broker connection.
#[async_trait]
pub trait BrokerConnection
where
    Self: Send + Sync + 'static,
{
    /// The error type for the connection.
    type Error: TransportError;

    /// The channel type for the connection.
    type Channel: BrokerChannel;

    /// Whether the connection is open.
    fn is_open(&self) -> bool;

    /// Registers a handler for shutdown, blocked and callback-error signals.
    fn on_signal(&self, handler: SignalHandler);

    /// Opens a channel.
    async fn create_channel(&self) -> Result<Self::Channel, Self::Error>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;
}

/// Options for a declared queue.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,

    /// Survives broker restarts.
    pub durable: bool,

    /// Restricted to the declaring connection.
    pub exclusive: bool,

    /// Deleted once the last consumer goes away.
    pub auto_delete: bool,

    /// Exchange rejected messages are routed to.
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    /// A durable, shared, persistent queue.
    #[must_use]
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: None,
        }
    }

    /// Routes rejected messages to `exchange`.
    #[must_use]
    pub fn with_dead_letter_exchange(mut self, exchange: Option<String>) -> Self {
        self.dead_letter_exchange = exchange;
        self
    }
}

/// Settles one delivery.
#[async_trait]
pub trait Acknowledge
where
    Self: Send + Sync + 'static,
{
    /// Positively acknowledges the delivery.
    async fn ack(&self) -> Result<(), BoxError>;

    /// Negatively acknowledges the delivery.
    async fn nack(&self, requeue: bool) -> Result<(), BoxError>;
}

/// A message received from a queue.
pub struct Delivery {
    /// Routing key the message was published with.
    pub routing_key: String,

    /// Message body.
    pub body: Bytes,

    /// Whether the broker delivered this message before.
    pub redelivered: bool,

    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    /// Creates a delivery settled through `acker`.
    #[must_use]
    pub fn new(
        routing_key: impl Into<String>,
        body: Bytes,
        redelivered: bool,
        acker: impl Acknowledge,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            redelivered,
            acker: Box::new(acker),
        }
    }

    /// Positively acknowledges the delivery.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the acknowledgement could not be sent.
    pub async fn ack(&self) -> Result<(), BoxError> {
        self.acker.ack().await
    }

    /// Negatively acknowledges the delivery.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the rejection could not be sent.
    pub async fn nack(&self, requeue: bool) -> Result<(), BoxError> {
        self.acker.nack(requeue).await
    }
}

impl Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries from one consumer. Ends when the consumer is
/// cancelled or its channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BoxError>>;

/// A broker channel. Clones share the underlying channel.
#[async_trait]
pub trait BrokerChannel
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the channel.
    type Error: TransportError;

    /// Whether the channel is open.
    fn is_open(&self) -> bool;

    /// Declares a durable direct exchange.
    async fn declare_exchange(&self, exchange: &str) -> Result<(), Self::Error>;

    /// Declares a queue.
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), Self::Error>;

    /// Binds `queue` to `exchange` with `routing_key`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Self::Error>;

    /// Removes the binding of `queue` to `exchange` for `routing_key`.
    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Self::Error>;

    /// Publishes a persistent message with the mandatory flag set.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<(), Self::Error>;

    /// Limits unacknowledged deliveries per consumer.
    async fn set_prefetch(&self, count: u16) -> Result<(), Self::Error>;

    /// Starts a manually acknowledged consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str)
    -> Result<DeliveryStream, Self::Error>;

    /// Cancels the consumer with `consumer_tag`.
    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), Self::Error>;

    /// Closes the channel. Unacknowledged deliveries return to their queues.
    async fn close(&self) -> Result<(), Self::Error>;
}

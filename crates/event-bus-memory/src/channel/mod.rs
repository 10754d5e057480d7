use crate::broker::MemoryBroker;
use crate::error::Error;

use async_trait::async_trait;
use bytes::Bytes;
use event_bus::transport::{BrokerChannel, DeliveryStream, QueueSpec};
use futures::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// A channel on a [`MemoryBroker`] connection.
#[derive(Clone, Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryChannel {
    pub(crate) const fn new(broker: MemoryBroker, id: u64) -> Self {
        Self { broker, id }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    type Error = Error;

    fn is_open(&self) -> bool {
        self.broker.is_channel_open(self.id)
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<(), Error> {
        self.broker.declare_exchange(self.id, exchange)
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), Error> {
        self.broker.declare_queue(self.id, queue)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), Error> {
        self.broker.bind_queue(self.id, queue, exchange, routing_key)
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        self.broker.unbind_queue(self.id, queue, exchange, routing_key)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<(), Error> {
        self.broker.publish_on(self.id, exchange, routing_key, payload)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), Error> {
        self.broker.set_prefetch(self.id, count)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, Error> {
        let receiver = self.broker.consume(self.id, queue, consumer_tag)?;

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), Error> {
        self.broker.cancel_consumer(self.id, consumer_tag)
    }

    async fn close(&self) -> Result<(), Error> {
        self.broker.close_channel(self.id);
        Ok(())
    }
}

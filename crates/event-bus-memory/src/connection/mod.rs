use crate::broker::MemoryBroker;
use crate::channel::MemoryChannel;
use crate::error::Error;

use async_trait::async_trait;
use event_bus::transport::{BrokerConnection, Connector, SignalHandler};
use tracing::debug;

/// Opens connections to a [`MemoryBroker`].
#[derive(Clone, Debug)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    /// Creates a connector for `broker`.
    #[must_use]
    pub const fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Error = Error;
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, Error> {
        let id = self.broker.open_connection()?;
        debug!(connection = id, "Memory connection opened");

        Ok(MemoryConnection {
            broker: self.broker.clone(),
            id,
        })
    }
}

/// A connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Error = Error;
    type Channel = MemoryChannel;

    fn is_open(&self) -> bool {
        self.broker.is_connection_open(self.id)
    }

    fn on_signal(&self, handler: SignalHandler) {
        self.broker.add_signal_handler(self.id, handler);
    }

    async fn create_channel(&self) -> Result<MemoryChannel, Error> {
        let id = self.broker.open_channel(self.id)?;

        Ok(MemoryChannel::new(self.broker.clone(), id))
    }

    async fn close(&self) -> Result<(), Error> {
        self.broker.close_connection(self.id);
        Ok(())
    }
}

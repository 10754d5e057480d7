use crate::connection::RabbitMqConnector;

use event_bus::{EventBus, EventBusConfig, EventBusType, ResolveHandler, Result};
use tracing::info;

/// An event bus backed by RabbitMQ.
pub type RabbitMqEventBus = EventBus<RabbitMqConnector>;

/// Builds the bus selected by `config.event_bus_type`.
///
/// No connection is opened until the first publish or subscribe.
///
/// # Errors
///
/// Returns [`event_bus::Error::Config`] if the configuration is invalid.
pub fn create<R>(config: EventBusConfig, resolver: R) -> Result<RabbitMqEventBus>
where
    R: ResolveHandler,
{
    match config.event_bus_type {
        EventBusType::RabbitMq => {
            let app_name = Some(config.subscriber_client_app_name.clone())
                .filter(|name| !name.is_empty());
            let connector = RabbitMqConnector::new(&config.connection_string)
                .with_connection_name(app_name);

            let bus = EventBus::new(config, connector, resolver)?;
            info!(
                exchange = %bus.config().default_topic_name,
                "RabbitMQ event bus created"
            );
            Ok(bus)
        }
    }
}

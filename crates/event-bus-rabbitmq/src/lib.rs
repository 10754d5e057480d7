//! RabbitMQ backend for the event bus, built on `lapin`.
//!
//! Use [`create`] to build a bus from an [`EventBusConfig`](event_bus::EventBusConfig).
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod channel;
mod connection;
mod error;
mod factory;

pub use channel::RabbitMqChannel;
pub use connection::{RabbitMqConnection, RabbitMqConnector};
pub use error::Error;
pub use factory::{RabbitMqEventBus, create};

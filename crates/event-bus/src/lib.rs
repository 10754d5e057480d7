//! Typed publish/subscribe bus for integration events exchanged between
//! services over a message broker.
//!
//! ```text
//! ┌──────────────┐  publish(event)   ┌──────────────┐   direct exchange
//! │  Service A   │ ────────────────▶ │   EventBus   │ ──────────────────┐
//! └──────────────┘                   └──────────────┘                   │
//!                                                                       ▼
//! ┌──────────────┐  handle(event)    ┌──────────────┐   {app}.{event}
//! │  Handler(s)  │ ◀──────────────── │ consumer task│ ◀──────── queue ──┘
//! └──────────────┘                   └──────────────┘
//! ```
//!
//! The bus is generic over a [`Connector`](transport::Connector); concrete
//! brokers live in their own crates.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod bus;
mod config;
mod connection;
mod error;
mod event;
mod handler;
mod normalizer;
mod registry;
mod retry;

/// Seam between the bus core and a concrete broker client.
pub mod transport;

pub use bus::EventBus;
pub use config::{DeliveryFailurePolicy, EventBusConfig, EventBusType};
pub use connection::{ConnectionState, PersistentConnection};
pub use error::{BoxError, ConsumeError, Error, Result};
pub use event::{IntegrationEvent, IntegrationEventMeta};
pub use handler::{
    HandlerInstance, HandlerProvider, HandlerType, IntegrationEventHandler, ResolveHandler,
};
pub use normalizer::{EventNameNormalizer, EventNameTrimming};
pub use registry::{PayloadType, SubscriptionBinding, SubscriptionRegistry};
pub use retry::{RetryError, RetryPolicy};

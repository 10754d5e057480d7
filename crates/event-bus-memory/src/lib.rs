//! In-memory broker backend for the event bus.
//!
//! Models direct exchanges, durable queues, round-robin consumers, manual
//! acknowledgement and dead-lettering closely enough to run the bus without a
//! live broker. A [`MemoryBroker`] also exposes fault injection (unreachable
//! broker, severed connections, failing publishes) for tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;
mod channel;
mod connection;
mod error;

pub use broker::{DeadLetter, MemoryBroker, ReturnedMessage};
pub use channel::MemoryChannel;
pub use connection::{MemoryConnection, MemoryConnector};
pub use error::Error;

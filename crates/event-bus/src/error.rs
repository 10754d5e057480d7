//! Error types for the event bus.

use thiserror::Error;

/// Type-erased error carried across the transport seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for event bus operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for event bus operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The broker could not be reached within the retry budget.
    #[error("{message}")]
    Connection {
        /// Human readable description of the failed operation.
        message: String,
        /// The innermost transport error.
        #[source]
        source: Option<BoxError>,
    },

    /// The handler type is already subscribed to the event.
    #[error("Handler type {handler} already registered for `{event_name}`")]
    DuplicateBinding {
        /// The canonical event name.
        event_name: String,
        /// The handler type name.
        handler: &'static str,
    },

    /// A channel was requested while no connection is open.
    #[error("Not connected to the broker")]
    NotConnected,

    /// The connection or bus has been disposed.
    #[error("Event bus connection has been disposed")]
    Disposed,

    /// The event could not be serialized.
    #[error("Failed to serialize event `{event_name}`: {source}")]
    Serialize {
        /// The canonical event name.
        event_name: String,
        /// The serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// Declaring, binding or unbinding broker topology failed.
    #[error("Topology operation `{operation}` failed for `{target}`: {source}")]
    Topology {
        /// The broker operation.
        operation: &'static str,
        /// The exchange or queue the operation targeted.
        target: String,
        /// The transport error.
        #[source]
        source: BoxError,
    },

    /// A channel level operation failed.
    #[error("Transport operation `{operation}` failed: {source}")]
    Transport {
        /// The broker operation.
        operation: &'static str,
        /// Whether retrying the operation may succeed.
        retriable: bool,
        /// The transport error.
        #[source]
        source: BoxError,
    },

    /// The configuration is invalid.
    #[error("Invalid event bus configuration: {0}")]
    Config(String),
}

impl Error {
    /// Check if this error is potentially recoverable with retry.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        match self {
            Self::NotConnected => true,
            Self::Transport { retriable, .. } => *retriable,
            _ => false,
        }
    }

    /// Unwraps to the innermost cause, boxing `self` when there is none.
    #[must_use]
    pub fn into_innermost(self) -> BoxError {
        match self {
            Self::Connection {
                source: Some(source),
                ..
            }
            | Self::Transport { source, .. }
            | Self::Topology { source, .. } => source,
            other => Box::new(other),
        }
    }
}

/// Errors raised while consuming a delivery.
///
/// The delivery that produced the error is never acknowledged.
#[derive(Debug, Error)]
pub enum ConsumeError {
    /// The message body did not decode into the registered payload type.
    #[error("Failed to deserialize event `{event_name}`: {source}")]
    Deserialize {
        /// The canonical event name.
        event_name: String,
        /// The deserializer error.
        #[source]
        source: serde_json::Error,
    },

    /// A handler returned an error.
    #[error("Handler {handler} failed for event `{event_name}`: {source}")]
    Handler {
        /// The canonical event name.
        event_name: String,
        /// The handler type name.
        handler: &'static str,
        /// The handler error.
        #[source]
        source: BoxError,
    },

    /// Acknowledging or rejecting the delivery failed.
    #[error("Failed to settle delivery of event `{event_name}`: {source}")]
    Acknowledge {
        /// The canonical event name.
        event_name: String,
        /// The transport error.
        #[source]
        source: BoxError,
    },
}

impl ConsumeError {
    /// The canonical name of the event whose delivery failed.
    #[must_use]
    pub fn event_name(&self) -> &str {
        match self {
            Self::Deserialize { event_name, .. }
            | Self::Handler { event_name, .. }
            | Self::Acknowledge { event_name, .. } => event_name,
        }
    }
}

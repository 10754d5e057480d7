use event_bus::transport::TransportError;
use thiserror::Error;

/// Errors raised by the RabbitMQ backend.
#[derive(Debug, Error)]
pub enum Error {
    /// An error from the AMQP client.
    #[error(transparent)]
    Lapin(#[from] lapin::Error),
}

impl TransportError for Error {
    fn is_retriable(&self) -> bool {
        let Self::Lapin(e) = self;

        matches!(
            e,
            lapin::Error::IOError(_)
                | lapin::Error::InvalidConnectionState(_)
                | lapin::Error::InvalidChannelState(_)
                | lapin::Error::MissingHeartbeatError
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::sync::Arc;

    #[test]
    fn test_io_errors_are_retriable() {
        let error = Error::from(lapin::Error::IOError(Arc::new(io::Error::other(
            "connection reset",
        ))));

        assert!(error.is_retriable());
    }

    #[test]
    fn test_protocol_limits_are_not_retriable() {
        assert!(!Error::from(lapin::Error::ChannelsLimitReached).is_retriable());
    }
}

use crate::error::{BoxError, Error, Result};
use crate::retry::{RetryError, RetryPolicy};
use crate::transport::{
    BrokerConnection, ChannelOf, ConnectionSignal, Connector, SignalHandler, TransportError,
};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of a [`PersistentConnection`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No live connection.
    Disconnected,

    /// A connect attempt is in progress.
    Connecting,

    /// A live connection is available.
    Connected,

    /// Terminal; no further connects are made.
    Disposed,
}

struct Shared<C: Connector> {
    connector: C,
    retry: RetryPolicy,
    current: ArcSwapOption<C::Connection>,
    connect_lock: Mutex<()>,
    state: watch::Sender<ConnectionState>,
    disposed: AtomicBool,
    cancel: CancellationToken,
}

/// Self-healing wrapper around one broker connection.
///
/// Connects with bounded exponential backoff and reconnects on its own when
/// the live connection reports a shutdown, blocked or callback-error signal.
/// Clones share the same connection.
pub struct PersistentConnection<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for PersistentConnection<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector> fmt::Debug for PersistentConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentConnection")
            .field("state", &self.state())
            .field("retry", &self.shared.retry)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> PersistentConnection<C> {
    /// Creates a disconnected instance.
    #[must_use]
    pub fn new(connector: C, retry: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            shared: Arc::new(Shared {
                connector,
                retry,
                current: ArcSwapOption::empty(),
                connect_lock: Mutex::new(()),
                state,
                disposed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Whether a connection exists and reports open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Subscribes to lifecycle changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Connects unless already connected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] with the innermost transport error once
    /// the retry budget is spent, or [`Error::Disposed`].
    pub async fn connect(&self) -> Result<()> {
        self.shared.connect().await
    }

    /// Like [`connect`](Self::connect), reporting only whether a connection
    /// is now established.
    pub async fn try_connect(&self) -> bool {
        match self.connect().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Could not connect to broker");
                false
            }
        }
    }

    /// Opens a channel on the live connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if no open connection exists.
    pub async fn create_channel(&self) -> Result<ChannelOf<C>> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }

        let connection = self
            .shared
            .current
            .load_full()
            .filter(|connection| connection.is_open())
            .ok_or(Error::NotConnected)?;

        connection
            .create_channel()
            .await
            .map_err(|e| Error::Transport {
                operation: "create_channel",
                retriable: e.is_retriable(),
                source: Box::new(e),
            })
    }

    /// Releases the connection and stops all future connects. Idempotent.
    #[instrument(skip(self))]
    pub async fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.cancel.cancel();
        self.shared.state.send_replace(ConnectionState::Disposed);

        let _guard = self.shared.connect_lock.lock().await;

        if let Some(connection) = self.shared.current.swap(None) {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "Error closing broker connection");
            }
        }

        info!("Broker connection disposed");
    }
}

impl<C: Connector> Shared<C> {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        !self.is_disposed()
            && self
                .current
                .load()
                .as_ref()
                .is_some_and(|connection| connection.is_open())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == ConnectionState::Disposed || *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn is_current(&self, origin: &Weak<C::Connection>) -> bool {
        self.current
            .load()
            .as_ref()
            .is_some_and(|connection| std::ptr::eq(Arc::as_ptr(connection), origin.as_ptr()))
    }

    #[instrument(skip(self))]
    async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }

        let _guard = self.connect_lock.lock().await;

        if self.is_disposed() {
            return Err(Error::Disposed);
        }

        if self.is_connected() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        info!("Connecting to broker");

        let connector = &self.connector;
        let result = self
            .retry
            .run(
                "connect",
                &self.cancel,
                |e: &C::Error| e.is_retriable(),
                move |_| connector.connect(),
            )
            .await;

        match result {
            Ok(connection) => {
                if self.is_disposed() {
                    if let Err(e) = connection.close().await {
                        debug!(error = %e, "Error closing connection opened during dispose");
                    }
                    return Err(Error::Disposed);
                }

                let connection = Arc::new(connection);
                connection.on_signal(self.signal_handler(&connection));
                self.current.store(Some(connection));
                self.set_state(ConnectionState::Connected);

                info!("Connected to broker");
                Ok(())
            }
            Err(RetryError::Cancelled) => Err(Error::Disposed),
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                error!(error = %e, "Failed to connect to broker");

                Err(connect_failure(e))
            }
        }
    }

    fn signal_handler(self: &Arc<Self>, connection: &Arc<C::Connection>) -> SignalHandler {
        let shared = Arc::downgrade(self);
        let origin = Arc::downgrade(connection);
        let runtime = Handle::current();

        Arc::new(move |signal| {
            let Some(shared) = shared.upgrade() else {
                return;
            };

            if shared.is_disposed() {
                return;
            }

            runtime.spawn(Self::reconnect(shared, origin.clone(), signal));
        })
    }

    fn reconnect(
        self: Arc<Self>,
        origin: Weak<C::Connection>,
        signal: ConnectionSignal,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            {
                let _guard = self.connect_lock.lock().await;

                if self.is_disposed() {
                    return;
                }

                if !self.is_current(&origin) {
                    debug!(?signal, "Ignoring signal from a replaced connection");
                    return;
                }

                if let Some(stale) = self.current.swap(None) {
                    tokio::spawn(async move {
                        if let Err(e) = stale.close().await {
                            debug!(error = %e, "Error closing lost connection");
                        }
                    });
                }

                self.set_state(ConnectionState::Disconnected);
            }

            warn!(?signal, "Broker connection lost, reconnecting");

            if let Err(e) = self.connect().await {
                error!(error = %e, "Reconnect failed");
            }
        })
    }
}

fn connect_failure<E: TransportError>(e: RetryError<E>) -> Error {
    let (message, source): (String, BoxError) = match e {
        RetryError::Exhausted { attempts, source } => (
            format!("Failed to connect to the broker after {attempts} retries."),
            Box::new(source),
        ),
        RetryError::Rejected(source) => (
            "Failed to connect to the broker: the error is not retriable.".to_string(),
            Box::new(source),
        ),
        timed_out @ RetryError::TimedOut { attempts, .. } => (
            format!("Failed to connect to the broker after {attempts} retries."),
            Box::new(timed_out),
        ),
        RetryError::Cancelled => return Error::Disposed,
    };

    Error::Connection {
        message,
        source: Some(source),
    }
}

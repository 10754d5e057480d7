use crate::config::EventBusConfig;
use crate::connection::PersistentConnection;
use crate::error::{BoxError, ConsumeError, Error, Result};
use crate::event::IntegrationEvent;
use crate::handler::{HandlerType, IntegrationEventHandler, ResolveHandler};
use crate::normalizer::EventNameNormalizer;
use crate::registry::SubscriptionRegistry;
use crate::retry::{RetryError, RetryPolicy};
use crate::transport::{
    BrokerChannel, ChannelOf, Connector, Delivery, DeliveryStream, QueueSpec, TransportError,
};

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CONSUME_ERROR_CAPACITY: usize = 64;

struct ConsumerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    tag: String,
}

struct BusInner<C: Connector> {
    config: EventBusConfig,
    normalizer: EventNameNormalizer,
    connection: PersistentConnection<C>,
    channel: Mutex<Option<ChannelOf<C>>>,
    topology: Mutex<()>,
    registry: SubscriptionRegistry,
    removals: Mutex<mpsc::UnboundedReceiver<String>>,
    pending_unbinds: parking_lot::Mutex<BTreeSet<String>>,
    resolver: Arc<dyn ResolveHandler>,
    consumers: parking_lot::Mutex<HashMap<String, ConsumerHandle>>,
    retry: RetryPolicy,
    consume_errors: broadcast::Sender<Arc<ConsumeError>>,
    shutdown: CancellationToken,
}

/// Typed publish/subscribe bus over a direct exchange.
///
/// Events are published with their canonical name as routing key. Each
/// subscribed event gets a durable queue `{app}.{event}` drained by a
/// dedicated consumer task; deliveries are acknowledged once every handler
/// succeeded.
///
/// Clones share the same connection, registry and consumers.
pub struct EventBus<C: Connector> {
    inner: Arc<BusInner<C>>,
}

impl<C: Connector> Clone for EventBus<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> fmt::Debug for EventBus<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("exchange", &self.inner.config.default_topic_name)
            .field("app", &self.inner.config.subscriber_client_app_name)
            .field("connection", &self.inner.connection)
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> EventBus<C> {
    /// Creates a bus. No connection is made until first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new<R>(config: EventBusConfig, connector: C, resolver: R) -> Result<Self>
    where
        R: ResolveHandler,
    {
        config.validate()?;

        let normalizer = config.normalizer();
        let retry = config.retry_policy();
        let (registry, removals) = SubscriptionRegistry::new(normalizer.clone());
        let (consume_errors, _) = broadcast::channel(CONSUME_ERROR_CAPACITY);

        Ok(Self {
            inner: Arc::new(BusInner {
                connection: PersistentConnection::new(connector, retry),
                config,
                normalizer,
                channel: Mutex::new(None),
                topology: Mutex::new(()),
                registry,
                removals: Mutex::new(removals),
                pending_unbinds: parking_lot::Mutex::new(BTreeSet::new()),
                resolver: Arc::new(resolver),
                consumers: parking_lot::Mutex::new(HashMap::new()),
                retry,
                consume_errors,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// The bus configuration.
    #[must_use]
    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    /// The underlying persistent connection.
    #[must_use]
    pub fn connection(&self) -> &PersistentConnection<C> {
        &self.inner.connection
    }

    /// The subscription registry.
    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    /// Receives every delivery failure from now on.
    #[must_use]
    pub fn consume_errors(&self) -> broadcast::Receiver<Arc<ConsumeError>> {
        self.inner.consume_errors.subscribe()
    }

    /// Whether a consumer task is draining the queue of `event_name`.
    #[must_use]
    pub fn is_consuming(&self, event_name: &str) -> bool {
        self.inner
            .consumers
            .lock()
            .get(event_name)
            .is_some_and(|consumer| !consumer.task.is_finished())
    }

    /// Connects, declares the exchange and unbinds the queues of events
    /// unsubscribed while the broker was unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the broker stays unreachable, or the
    /// error of a queue unbind left over from an earlier unsubscribe.
    pub async fn connect(&self) -> Result<()> {
        self.inner.channel(true).await.map(drop)?;
        self.inner.process_removals().await
    }

    /// Publishes `event` to the exchange, routed by its canonical name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] naming the event and the retry count
    /// when the broker stays unreachable for the whole retry budget.
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<()> {
        let inner = &self.inner;
        let event_name = inner.registry.event_key::<E>();
        let publish_failed = |source: BoxError| Error::Connection {
            message: format!(
                "Failed to publish event '{event_name}' after {} retries.",
                inner.config.connection_retry_count
            ),
            source: Some(source),
        };

        let body = serde_json::to_vec(event)
            .map(Bytes::from)
            .map_err(|source| Error::Serialize {
                event_name: event_name.clone(),
                source,
            })?;

        match inner.connection.connect().await {
            Ok(()) => {}
            Err(Error::Disposed) => return Err(Error::Disposed),
            Err(e) => return Err(publish_failed(e.into_innermost())),
        }

        if inner.has_pending_unbinds() {
            if let Err(e) = inner.process_removals().await {
                warn!(error = %e, "Queue unbind still pending");
            }
        }

        debug!(event = %event_name, id = %event.id(), "Publishing event");

        let exchange = inner.config.default_topic_name.as_str();
        let result = inner
            .retry
            .run("publish", &inner.shutdown, Error::is_retriable, |_| {
                let body = body.clone();
                let event_name = event_name.as_str();

                async move {
                    let channel = inner.channel(false).await?;

                    channel
                        .publish(exchange, event_name, body)
                        .await
                        .map_err(|e| transport_error("basic_publish", e))
                }
            })
            .await;

        match result {
            Ok(()) => {
                debug!(event = %event_name, "Event published");
                Ok(())
            }
            Err(RetryError::Cancelled) => Err(Error::Disposed),
            Err(RetryError::Rejected(e)) => Err(e),
            Err(RetryError::Exhausted { source, .. }) => {
                Err(publish_failed(source.into_innermost()))
            }
            Err(timed_out @ RetryError::TimedOut { .. }) => {
                Err(publish_failed(Box::new(timed_out)))
            }
        }
    }

    /// Subscribes handler `H` to events of type `E`.
    ///
    /// The first subscription of an event declares its queue and binds it to
    /// the exchange.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateBinding`] if `H` already handles `E`, and
    /// connection or topology errors if the queue could not be set up.
    pub async fn subscribe<E, H>(&self) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let inner = &self.inner;

        if inner.config.subscriber_client_app_name.trim().is_empty() {
            return Err(Error::Config(
                "subscriber_client_app_name is required to subscribe".to_string(),
            ));
        }

        let event_name = inner.registry.event_key::<E>();
        let queue = inner.config.queue_name(&event_name);

        {
            let _topology = inner.topology.lock().await;

            if !inner.registry.has_subscription(&event_name) {
                inner.bind_queue(&event_name, &queue).await?;
            }

            inner.registry.add_subscription::<E, H>()?;
            BusInner::ensure_consumer(inner, &event_name, queue.clone());
        }

        info!(
            event = %event_name,
            handler = HandlerType::of::<H>().name(),
            queue = %queue,
            "Subscribed to event"
        );

        if inner.has_pending_unbinds() {
            inner.process_removals().await?;
        }

        Ok(())
    }

    /// Unsubscribes handler `H` from events of type `E`. Returns `false` if
    /// it was not subscribed.
    ///
    /// Removing the last handler of an event stops its consumer and unbinds
    /// its queue, connecting first if needed.
    ///
    /// # Errors
    ///
    /// Returns connection or topology errors if the queue could not be
    /// unbound. The binding is removed regardless; the unbind is retried on
    /// the next connect, publish, subscribe or unsubscribe.
    pub async fn unsubscribe<E, H>(&self) -> Result<bool>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let removed = self.inner.registry.remove_subscription::<E, H>();

        if removed {
            info!(
                event = %self.inner.registry.event_key::<E>(),
                handler = HandlerType::of::<H>().name(),
                "Unsubscribed from event"
            );
        }

        self.inner.process_removals().await?;

        Ok(removed)
    }

    /// Removes every subscription.
    ///
    /// # Errors
    ///
    /// Returns topology errors if a queue could not be unbound.
    pub async fn unsubscribe_all(&self) -> Result<()> {
        self.inner.registry.clear();
        self.inner.process_removals().await
    }

    /// Decodes `body` and runs every handler bound to the event named by
    /// `routing_key`, in subscription order.
    ///
    /// Returns `Ok(false)` if no handler is bound. Handlers that cannot be
    /// resolved are skipped.
    ///
    /// # Errors
    ///
    /// Returns the first decoding or handler failure.
    pub async fn process_event(
        &self,
        routing_key: &str,
        body: &[u8],
    ) -> Result<bool, ConsumeError> {
        self.inner.process_event(routing_key, body).await
    }

    /// Stops all consumers and releases the channel and connection.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();

        let consumers: Vec<_> = inner.consumers.lock().drain().map(|(_, c)| c).collect();

        inner.close_channel().await;
        inner.connection.dispose().await;

        for consumer in consumers {
            if let Err(e) = consumer.task.await {
                warn!(consumer = %consumer.tag, error = %e, "Consumer task ended abnormally");
            }
        }

        info!("Event bus disposed");
    }
}

impl<C: Connector> BusInner<C> {
    /// Returns the shared channel, opening it (and declaring the exchange) if
    /// needed. With `connect`, connects first.
    async fn channel(&self, connect: bool) -> Result<MappedMutexGuard<'_, ChannelOf<C>>> {
        if connect {
            self.connection.connect().await?;
        }

        let mut slot = self.channel.lock().await;

        if !slot.as_ref().is_some_and(|channel| channel.is_open()) {
            *slot = None;

            let exchange = &self.config.default_topic_name;
            let channel = self.connection.create_channel().await?;

            if self.config.prefetch_count > 0 {
                channel
                    .set_prefetch(self.config.prefetch_count)
                    .await
                    .map_err(|e| transport_error("basic_qos", e))?;
            }

            channel
                .declare_exchange(exchange)
                .await
                .map_err(|e| topology_error("exchange_declare", exchange, e))?;

            debug!(exchange = %exchange, "Channel opened");
            *slot = Some(channel);
        }

        MutexGuard::try_map(slot, Option::as_mut).map_err(|_| Error::NotConnected)
    }

    async fn close_channel(&self) {
        if let Some(channel) = self.channel.lock().await.take() {
            if let Err(e) = channel.close().await {
                debug!(error = %e, "Error closing channel");
            }
        }
    }

    async fn bind_queue(&self, event_name: &str, queue: &str) -> Result<()> {
        let exchange = &self.config.default_topic_name;
        let spec = QueueSpec::durable(queue)
            .with_dead_letter_exchange(self.config.dead_letter_exchange.clone());
        let channel = self.channel(true).await?;

        channel
            .declare_queue(&spec)
            .await
            .map_err(|e| topology_error("queue_declare", queue, e))?;
        channel
            .bind_queue(queue, exchange, event_name)
            .await
            .map_err(|e| topology_error("queue_bind", queue, e))?;

        debug!(queue = %queue, exchange = %exchange, routing_key = %event_name, "Queue bound");

        Ok(())
    }

    fn has_pending_unbinds(&self) -> bool {
        !self.pending_unbinds.lock().is_empty()
    }

    /// Stops the consumer and unbinds the queue of every event whose last
    /// handler was removed. Events whose unbind fails stay pending.
    async fn process_removals(&self) -> Result<()> {
        let mut removals = self.removals.lock().await;

        while let Ok(event_name) = removals.try_recv() {
            self.pending_unbinds.lock().insert(event_name);
        }

        let pending: Vec<String> = self.pending_unbinds.lock().iter().cloned().collect();

        for event_name in pending {
            let _topology = self.topology.lock().await;

            if self.registry.has_subscription(&event_name) {
                debug!(event = %event_name, "Event subscribed again, keeping queue");
            } else {
                self.stop_consumer(&event_name).await;

                if let Err(e) = self.unbind_queue(&event_name).await {
                    warn!(event = %event_name, error = %e, "Failed to unbind queue, will retry");
                    return Err(e);
                }
            }

            self.pending_unbinds.lock().remove(&event_name);
        }

        drop(removals);

        let _topology = self.topology.lock().await;
        if self.registry.is_empty() {
            self.close_channel().await;
        }

        Ok(())
    }

    async fn unbind_queue(&self, event_name: &str) -> Result<()> {
        let exchange = &self.config.default_topic_name;
        let queue = self.config.queue_name(event_name);
        let channel = self.channel(true).await?;

        channel
            .unbind_queue(&queue, exchange, event_name)
            .await
            .map_err(|e| topology_error("queue_unbind", &queue, e))?;

        debug!(queue = %queue, routing_key = %event_name, "Queue unbound");

        Ok(())
    }

    fn ensure_consumer(self: &Arc<Self>, event_name: &str, queue: String) {
        let mut consumers = self.consumers.lock();

        if consumers
            .get(event_name)
            .is_some_and(|consumer| !consumer.task.is_finished())
        {
            return;
        }

        let cancel = self.shutdown.child_token();
        let tag = format!("{queue}.{}", Uuid::new_v4().simple());
        let task = tokio::spawn(run_consumer(
            Arc::downgrade(self),
            queue,
            tag.clone(),
            cancel.clone(),
        ));

        consumers.insert(event_name.to_string(), ConsumerHandle { cancel, task, tag });
    }

    async fn stop_consumer(&self, event_name: &str) {
        let Some(consumer) = self.consumers.lock().remove(event_name) else {
            return;
        };

        consumer.cancel.cancel();

        let channel = self.channel.lock().await.clone();
        if let Some(channel) = channel.filter(|channel| channel.is_open()) {
            if let Err(e) = channel.cancel_consumer(&consumer.tag).await {
                debug!(consumer = %consumer.tag, error = %e, "Error cancelling consumer");
            }
        }

        debug!(event = %event_name, consumer = %consumer.tag, "Consumer stopped");
    }

    async fn open_consumer(&self, queue: &str, tag: &str) -> Result<DeliveryStream> {
        let channel = self.channel(true).await?.clone();

        channel
            .consume(queue, tag)
            .await
            .map_err(|e| transport_error("basic_consume", e))
    }

    async fn process_event(&self, routing_key: &str, body: &[u8]) -> Result<bool, ConsumeError> {
        let event_name = self.normalizer.normalize(routing_key);

        let Some((payload_type, bindings)) = self.registry.dispatch_plan(&event_name) else {
            return Ok(false);
        };

        let payload = payload_type
            .decode(body)
            .map_err(|source| ConsumeError::Deserialize {
                event_name: event_name.clone(),
                source,
            })?;

        for binding in bindings {
            let handler = binding.handler();

            let Some(instance) = self.resolver.resolve(handler) else {
                warn!(event = %event_name, handler = handler.name(), "Handler not resolvable, skipping");
                continue;
            };

            binding
                .invoke(instance, payload.clone())
                .await
                .map_err(|source| ConsumeError::Handler {
                    event_name: event_name.clone(),
                    handler: handler.name(),
                    source,
                })?;

            debug!(event = %event_name, handler = handler.name(), "Event handled");
        }

        Ok(true)
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let event_name = self.normalizer.normalize(&delivery.routing_key);

        let settled = match self.process_event(&delivery.routing_key, &delivery.body).await {
            Ok(true) => delivery.ack().await,
            Ok(false) => {
                warn!(event = %event_name, "No subscription for event, dropping message");
                delivery.ack().await
            }
            Err(e) => {
                error!(
                    event = %event_name,
                    redelivered = delivery.redelivered,
                    error = %e,
                    "Failed to process event"
                );
                self.report(e);

                match self
                    .config
                    .delivery_failure_policy
                    .requeue(delivery.redelivered)
                {
                    Some(requeue) => delivery.nack(requeue).await,
                    None => Ok(()),
                }
            }
        };

        if let Err(source) = settled {
            let e = ConsumeError::Acknowledge { event_name, source };
            error!(error = %e, "Failed to settle delivery");
            self.report(e);
        }
    }

    fn report(&self, error: ConsumeError) {
        // Nobody listening is fine.
        let _ = self.consume_errors.send(Arc::new(error));
    }
}

impl<C: Connector> Drop for BusInner<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Drains one queue until cancelled, reopening the consumer with backoff when
/// its stream ends.
async fn run_consumer<C: Connector>(
    bus: Weak<BusInner<C>>,
    queue: String,
    tag: String,
    cancel: CancellationToken,
) {
    let mut failures = 0;

    while !cancel.is_cancelled() {
        let Some(inner) = bus.upgrade() else {
            return;
        };
        let retry = inner.retry;
        let opened = tokio::select! {
            () = cancel.cancelled() => return,
            opened = inner.open_consumer(&queue, &tag) => opened,
        };
        drop(inner);

        match opened {
            Ok(mut deliveries) => {
                failures = 0;
                debug!(queue = %queue, consumer = %tag, "Consumer started");

                loop {
                    let next = tokio::select! {
                        () = cancel.cancelled() => return,
                        next = deliveries.next() => next,
                    };

                    match next {
                        Some(Ok(delivery)) => {
                            let Some(inner) = bus.upgrade() else {
                                return;
                            };
                            inner.handle_delivery(delivery).await;
                        }
                        Some(Err(e)) => {
                            warn!(queue = %queue, error = %e, "Error receiving delivery");
                        }
                        None => break,
                    }
                }

                warn!(queue = %queue, consumer = %tag, "Delivery stream ended, restarting consumer");
            }
            Err(Error::Disposed) => return,
            Err(e) => {
                failures += 1;
                warn!(queue = %queue, attempt = failures, error = %e, "Failed to start consumer");
            }
        }

        let delay = retry.delay_for(failures.clamp(1, retry.max_attempts()));

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

fn transport_error<E: TransportError>(operation: &'static str, e: E) -> Error {
    Error::Transport {
        operation,
        retriable: e.is_retriable(),
        source: Box::new(e),
    }
}

/// Transient failures stay retriable; anything else is a topology error.
fn topology_error<E: TransportError>(operation: &'static str, target: &str, e: E) -> Error {
    if e.is_retriable() {
        return transport_error(operation, e);
    }

    Error::Topology {
        operation,
        target: target.to_string(),
        source: Box::new(e),
    }
}

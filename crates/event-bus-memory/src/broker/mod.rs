use crate::error::Error;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use event_bus::BoxError;
use event_bus::transport::{Acknowledge, ConnectionSignal, Delivery, QueueSpec, SignalHandler};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

pub(crate) type DeliveryReceiver = mpsc::UnboundedReceiver<Result<Delivery, BoxError>>;

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, BoxError>>;

/// A mandatory message no queue was bound for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReturnedMessage {
    /// Exchange the message was published to.
    pub exchange: String,

    /// Routing key of the message.
    pub routing_key: String,

    /// Message body.
    pub body: Bytes,
}

/// A message rejected without requeue from a queue with no dead-letter
/// exchange.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeadLetter {
    /// Queue the message was rejected from.
    pub queue: String,

    /// Routing key of the message.
    pub routing_key: String,

    /// Message body.
    pub body: Bytes,
}

#[derive(Clone)]
struct Message {
    routing_key: String,
    body: Bytes,
    redelivered: bool,
}

struct Unacked {
    message: Message,
    channel: u64,
    consumer: String,
}

struct Consumer {
    tag: String,
    channel: u64,
    sender: DeliverySender,
}

struct Queue {
    spec: QueueSpec,
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

impl Queue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    /// Round-robin over consumers with prefetch capacity left.
    fn next_consumer(&mut self, channels: &HashMap<u64, ChannelEntry>) -> Option<usize> {
        let count = self.consumers.len();

        for offset in 0..count {
            let index = (self.next_consumer + offset) % count;
            let consumer = &self.consumers[index];
            let prefetch = channels
                .get(&consumer.channel)
                .map_or(0, |channel| channel.prefetch);
            let in_flight = self
                .unacked
                .values()
                .filter(|u| u.channel == consumer.channel && u.consumer == consumer.tag)
                .count();

            if prefetch == 0 || in_flight < usize::from(prefetch) {
                self.next_consumer = index + 1;
                return Some(index);
            }
        }

        None
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

struct ConnectionEntry {
    open: bool,
    handlers: Vec<SignalHandler>,
}

struct ChannelEntry {
    connection: u64,
    open: bool,
    prefetch: u16,
}

#[derive(Default)]
struct State {
    handle: Weak<Mutex<State>>,
    unreachable: bool,
    refuse_access: bool,
    connect_attempts: usize,
    failing_publishes: usize,
    next_id: u64,
    next_delivery_tag: u64,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    exchanges: HashSet<String>,
    queues: HashMap<String, Queue>,
    bindings: HashSet<Binding>,
    returned: Vec<ReturnedMessage>,
    dead_lettered: Vec<DeadLetter>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_channel(&self, channel: u64) -> Result<(), Error> {
        let entry = self
            .channels
            .get(&channel)
            .filter(|entry| entry.open)
            .ok_or(Error::ChannelClosed)?;

        if self
            .connections
            .get(&entry.connection)
            .is_some_and(|connection| connection.open)
        {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        mandatory: bool,
    ) -> Result<(), Error> {
        if !self.exchanges.contains(exchange) {
            return Err(Error::ExchangeNotFound(exchange.to_string()));
        }

        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();

        if targets.is_empty() {
            debug!(exchange, routing_key, "Message unroutable");
            if mandatory {
                self.returned.push(ReturnedMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body,
                });
            }
            return Ok(());
        }

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.ready.push_back(Message {
                    routing_key: routing_key.to_string(),
                    body: body.clone(),
                    redelivered: false,
                });
            }
            self.dispatch(&target);
        }

        Ok(())
    }

    fn dispatch(&mut self, queue_name: &str) {
        let Self {
            handle,
            queues,
            channels,
            next_delivery_tag,
            ..
        } = self;

        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        while !queue.ready.is_empty() {
            let Some(index) = queue.next_consumer(channels) else {
                break;
            };
            let Some(message) = queue.ready.pop_front() else {
                break;
            };

            *next_delivery_tag += 1;
            let delivery_tag = *next_delivery_tag;
            let channel = queue.consumers[index].channel;
            let consumer = queue.consumers[index].tag.clone();

            let delivery = Delivery::new(
                message.routing_key.clone(),
                message.body.clone(),
                message.redelivered,
                MemoryAcker {
                    state: handle.clone(),
                    queue: queue_name.to_string(),
                    delivery_tag,
                },
            );

            if queue.consumers[index].sender.send(Ok(delivery)).is_err() {
                debug!(queue = queue_name, consumer = %consumer, "Consumer gone, requeueing");
                queue.consumers.remove(index);
                queue.ready.push_front(message);
                continue;
            }

            queue.unacked.insert(
                delivery_tag,
                Unacked {
                    message,
                    channel,
                    consumer,
                },
            );
        }
    }

    fn settle(&mut self, queue_name: &str, delivery_tag: u64, outcome: Settle) -> Result<(), Error> {
        let queue = self
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))?;
        let Unacked { mut message, .. } = queue
            .unacked
            .remove(&delivery_tag)
            .ok_or(Error::UnknownDelivery(delivery_tag))?;

        match outcome {
            Settle::Ack => {}
            Settle::Requeue => {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
            Settle::Reject => match queue.spec.dead_letter_exchange.clone() {
                Some(exchange) if self.exchanges.contains(&exchange) => {
                    self.route(&exchange, &message.routing_key, message.body, false)?;
                }
                _ => self.dead_lettered.push(DeadLetter {
                    queue: queue_name.to_string(),
                    routing_key: message.routing_key,
                    body: message.body,
                }),
            },
        }

        self.dispatch(queue_name);

        Ok(())
    }

    fn close_channel(&mut self, channel: u64) {
        match self.channels.get_mut(&channel) {
            Some(entry) if entry.open => entry.open = false,
            _ => return,
        }

        let names: Vec<String> = self.queues.keys().cloned().collect();

        for name in &names {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.consumers.retain(|c| c.channel != channel);

                let mut tags: Vec<u64> = queue
                    .unacked
                    .iter()
                    .filter(|(_, u)| u.channel == channel)
                    .map(|(tag, _)| *tag)
                    .collect();
                tags.sort_unstable();

                for tag in tags.into_iter().rev() {
                    if let Some(Unacked { mut message, .. }) = queue.unacked.remove(&tag) {
                        message.redelivered = true;
                        queue.ready.push_front(message);
                    }
                }
            }

            self.dispatch(name);
        }
    }

    fn close_connection(&mut self, connection: u64) -> Vec<SignalHandler> {
        let handlers = match self.connections.get_mut(&connection) {
            Some(entry) if entry.open => {
                entry.open = false;
                entry.handlers.clone()
            }
            _ => return Vec::new(),
        };

        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, entry)| entry.connection == connection)
            .map(|(id, _)| *id)
            .collect();

        for channel in channels {
            self.close_channel(channel);
        }

        handlers
    }
}

enum Settle {
    Ack,
    Requeue,
    Reject,
}

struct MemoryAcker {
    state: Weak<Mutex<State>>,
    queue: String,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, outcome: Settle) -> Result<(), BoxError> {
        let state = self.state.upgrade().ok_or(Error::ConnectionClosed)?;
        let mut state = state.lock();

        state
            .settle(&self.queue, self.delivery_tag, outcome)
            .map_err(Into::into)
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), BoxError> {
        self.settle(Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BoxError> {
        self.settle(if requeue {
            Settle::Requeue
        } else {
            Settle::Reject
        })
    }
}

/// A process-local broker. Clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            state: Arc::new_cyclic(|handle| {
                Mutex::new(State {
                    handle: handle.clone(),
                    ..State::default()
                })
            }),
        }
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBroker")
            .field("exchanges", &state.exchanges)
            .field("queues", &state.queues.keys().collect::<Vec<_>>())
            .field("bindings", &state.bindings)
            .finish_non_exhaustive()
    }
}

impl MemoryBroker {
    /// Creates an empty, reachable broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the broker accept or refuse new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// Makes the broker reject credentials, a failure not worth retrying.
    pub fn set_access_refused(&self, refused: bool) {
        self.state.lock().refuse_access = refused;
    }

    /// Number of connection attempts seen so far.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    /// Makes the next `count` publishes fail with a retriable error.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().failing_publishes = count;
    }

    /// Closes every open connection and raises a shutdown signal on each.
    pub fn sever_connections(&self) {
        let handlers: Vec<SignalHandler> = {
            let mut state = self.state.lock();
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, entry)| entry.open)
                .map(|(id, _)| *id)
                .collect();

            open.into_iter()
                .flat_map(|id| state.close_connection(id))
                .collect()
        };

        for handler in handlers {
            handler(ConnectionSignal::Shutdown);
        }
    }

    /// Raises a blocked signal on every open connection.
    pub fn block_connections(&self) {
        let handlers: Vec<SignalHandler> = self
            .state
            .lock()
            .connections
            .values()
            .filter(|entry| entry.open)
            .flat_map(|entry| entry.handlers.clone())
            .collect();

        for handler in handlers {
            handler(ConnectionSignal::Blocked);
        }
    }

    /// Publishes as if from another client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExchangeNotFound`] if the exchange is not declared.
    pub fn publish(&self, exchange: &str, routing_key: &str, body: Bytes) -> Result<(), Error> {
        self.state.lock().route(exchange, routing_key, body, true)
    }

    /// Number of open connections.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|entry| entry.open)
            .count()
    }

    /// Whether the exchange is declared.
    #[must_use]
    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains(exchange)
    }

    /// The declared queue, if any.
    #[must_use]
    pub fn queue(&self, queue: &str) -> Option<QueueSpec> {
        self.state.lock().queues.get(queue).map(|q| q.spec.clone())
    }

    /// Whether `queue` is bound to `exchange` with `routing_key`.
    #[must_use]
    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.state.lock().bindings.contains(&Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        })
    }

    /// Messages waiting in `queue`.
    #[must_use]
    pub fn ready_count(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` and not yet settled.
    #[must_use]
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Consumers attached to `queue`.
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Mandatory messages that matched no binding.
    #[must_use]
    pub fn returned(&self) -> Vec<ReturnedMessage> {
        self.state.lock().returned.clone()
    }

    /// Messages rejected from queues without a dead-letter exchange.
    #[must_use]
    pub fn dead_lettered(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_lettered.clone()
    }

    pub(crate) fn open_connection(&self) -> Result<u64, Error> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;

        if state.unreachable {
            return Err(Error::Unreachable);
        }

        if state.refuse_access {
            return Err(Error::AccessRefused);
        }

        let id = state.next_id();
        state.connections.insert(
            id,
            ConnectionEntry {
                open: true,
                handlers: Vec::new(),
            },
        );

        Ok(id)
    }

    pub(crate) fn is_connection_open(&self, connection: u64) -> bool {
        self.state
            .lock()
            .connections
            .get(&connection)
            .is_some_and(|entry| entry.open)
    }

    pub(crate) fn add_signal_handler(&self, connection: u64, handler: SignalHandler) {
        if let Some(entry) = self.state.lock().connections.get_mut(&connection) {
            entry.handlers.push(handler);
        }
    }

    pub(crate) fn close_connection(&self, connection: u64) {
        // Client-initiated closes raise no signal.
        self.state.lock().close_connection(connection);
    }

    pub(crate) fn open_channel(&self, connection: u64) -> Result<u64, Error> {
        let mut state = self.state.lock();

        if !state
            .connections
            .get(&connection)
            .is_some_and(|entry| entry.open)
        {
            return Err(Error::ConnectionClosed);
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelEntry {
                connection,
                open: true,
                prefetch: 0,
            },
        );

        Ok(id)
    }

    pub(crate) fn is_channel_open(&self, channel: u64) -> bool {
        self.state.lock().check_channel(channel).is_ok()
    }

    pub(crate) fn close_channel(&self, channel: u64) {
        self.state.lock().close_channel(channel);
    }

    pub(crate) fn declare_exchange(&self, channel: u64, exchange: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.check_channel(channel)?;
        state.exchanges.insert(exchange.to_string());
        Ok(())
    }

    pub(crate) fn declare_queue(&self, channel: u64, spec: &QueueSpec) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.check_channel(channel)?;

        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => {
                Err(Error::PreconditionFailed(spec.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(spec.name.clone(), Queue::new(spec.clone()));
                Ok(())
            }
        }
    }

    pub(crate) fn bind_queue(
        &self,
        channel: u64,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.check_channel(channel)?;

        if !state.exchanges.contains(exchange) {
            return Err(Error::ExchangeNotFound(exchange.to_string()));
        }
        if !state.queues.contains_key(queue) {
            return Err(Error::QueueNotFound(queue.to_string()));
        }

        state.bindings.insert(Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        });

        Ok(())
    }

    pub(crate) fn unbind_queue(
        &self,
        channel: u64,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.check_channel(channel)?;

        state.bindings.remove(&Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        });

        Ok(())
    }

    pub(crate) fn publish_on(
        &self,
        channel: u64,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.check_channel(channel)?;

        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(Error::PublishFailed);
        }

        state.route(exchange, routing_key, body, true)
    }

    pub(crate) fn set_prefetch(&self, channel: u64, count: u16) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.check_channel(channel)?;

        if let Some(entry) = state.channels.get_mut(&channel) {
            entry.prefetch = count;
        }

        Ok(())
    }

    pub(crate) fn consume(
        &self,
        channel: u64,
        queue_name: &str,
        tag: &str,
    ) -> Result<DeliveryReceiver, Error> {
        let mut state = self.state.lock();
        state.check_channel(channel)?;

        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| Error::QueueNotFound(queue_name.to_string()))?;

        if queue
            .consumers
            .iter()
            .any(|c| c.channel == channel && c.tag == tag)
        {
            return Err(Error::DuplicateConsumer(tag.to_string()));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        queue.consumers.push(Consumer {
            tag: tag.to_string(),
            channel,
            sender,
        });
        state.dispatch(queue_name);

        Ok(receiver)
    }

    pub(crate) fn cancel_consumer(&self, channel: u64, tag: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.check_channel(channel)?;

        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.channel == channel && c.tag == tag));
        }

        Ok(())
    }
}

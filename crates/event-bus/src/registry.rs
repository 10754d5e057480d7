use crate::error::{BoxError, Error, Result};
use crate::event::IntegrationEvent;
use crate::handler::{HandlerInstance, HandlerType, IntegrationEventHandler};
use crate::normalizer::EventNameNormalizer;

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// A decoded payload shared by all handlers of one delivery.
pub(crate) type Payload = Arc<dyn Any + Send + Sync>;

type DecodeFn = fn(&[u8]) -> serde_json::Result<Payload>;

type InvokeFn =
    Arc<dyn Fn(HandlerInstance, Payload) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// The concrete payload type registered for an event name, with its decoder.
#[derive(Clone, Copy)]
pub struct PayloadType {
    name: &'static str,
    id: TypeId,
    decode: DecodeFn,
}

impl PayloadType {
    /// Returns the payload type of `E`.
    #[must_use]
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            name: E::type_name(),
            id: TypeId::of::<E>(),
            decode: decode_as::<E>,
        }
    }

    /// The event type name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this is the payload type of `E`.
    #[must_use]
    pub fn is<E: 'static>(&self) -> bool {
        self.id == TypeId::of::<E>()
    }

    pub(crate) fn decode(&self, body: &[u8]) -> serde_json::Result<Payload> {
        (self.decode)(body)
    }
}

impl fmt::Debug for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

fn decode_as<E: IntegrationEvent>(body: &[u8]) -> serde_json::Result<Payload> {
    serde_json::from_slice::<E>(body).map(|event| Arc::new(event) as Payload)
}

/// Association between a canonical event name and a handler type.
#[derive(Clone)]
pub struct SubscriptionBinding {
    event_name: String,
    handler: HandlerType,
    invoke: InvokeFn,
}

impl SubscriptionBinding {
    fn typed<E, H>(event_name: String) -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let invoke: InvokeFn = Arc::new(|instance: HandlerInstance, payload: Payload| {
            Box::pin(async move {
                let handler = instance.downcast::<H>().map_err(|_| {
                    BoxError::from(format!(
                        "resolved handler is not a {}",
                        HandlerType::of::<H>().name()
                    ))
                })?;
                let event = payload
                    .downcast_ref::<E>()
                    .cloned()
                    .ok_or_else(|| BoxError::from(format!("payload is not a {}", E::type_name())))?;

                handler.handle(event).await.map_err(BoxError::from)
            })
        });

        Self {
            event_name,
            handler: HandlerType::of::<H>(),
            invoke,
        }
    }

    /// The canonical event name.
    #[must_use]
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    /// The bound handler type.
    #[must_use]
    pub const fn handler(&self) -> HandlerType {
        self.handler
    }

    pub(crate) fn invoke(
        &self,
        instance: HandlerInstance,
        payload: Payload,
    ) -> BoxFuture<'static, Result<(), BoxError>> {
        (self.invoke)(instance, payload)
    }
}

impl fmt::Debug for SubscriptionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionBinding")
            .field("event_name", &self.event_name)
            .field("handler", &self.handler)
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    handlers: HashMap<String, Vec<SubscriptionBinding>>,
    event_types: HashMap<String, PayloadType>,
}

/// In-memory mapping from canonical event names to handler bindings.
///
/// When the last binding of an event name is removed, the name is sent on the
/// removal channel returned by [`SubscriptionRegistry::new`].
pub struct SubscriptionRegistry {
    normalizer: EventNameNormalizer,
    state: Mutex<RegistryState>,
    removed: mpsc::UnboundedSender<String>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry and the receiver of its removal
    /// notifications.
    #[must_use]
    pub fn new(normalizer: EventNameNormalizer) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (removed, receiver) = mpsc::unbounded_channel();

        let registry = Self {
            normalizer,
            state: Mutex::new(RegistryState::default()),
            removed,
        };

        (registry, receiver)
    }

    /// The canonical event name of `E`.
    #[must_use]
    pub fn event_key<E: IntegrationEvent>(&self) -> String {
        self.normalizer.normalize(E::type_name())
    }

    /// Binds handler `H` to event `E`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateBinding`] if `H` is already bound to `E`; the
    /// registry is left unchanged.
    pub fn add_subscription<E, H>(&self) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_name = self.event_key::<E>();
        let handler = HandlerType::of::<H>();
        let mut state = self.state.lock();

        if state
            .handlers
            .get(&event_name)
            .is_some_and(|bindings| bindings.iter().any(|b| b.handler == handler))
        {
            return Err(Error::DuplicateBinding {
                event_name,
                handler: handler.name(),
            });
        }

        state
            .event_types
            .entry(event_name.clone())
            .or_insert_with(PayloadType::of::<E>);
        state
            .handlers
            .entry(event_name.clone())
            .or_default()
            .push(SubscriptionBinding::typed::<E, H>(event_name.clone()));

        debug!(event = %event_name, handler = handler.name(), "binding added");

        Ok(())
    }

    /// Unbinds handler `H` from event `E`. Returns `false` if it was not
    /// bound.
    pub fn remove_subscription<E, H>(&self) -> bool
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let event_name = self.event_key::<E>();
        let handler = HandlerType::of::<H>();
        let mut state = self.state.lock();

        let Some(bindings) = state.handlers.get_mut(&event_name) else {
            return false;
        };
        let Some(index) = bindings.iter().position(|b| b.handler == handler) else {
            return false;
        };

        bindings.remove(index);
        debug!(event = %event_name, handler = handler.name(), "binding removed");

        if bindings.is_empty() {
            state.handlers.remove(&event_name);
            state.event_types.remove(&event_name);
            self.notify_removed(event_name);
        }

        true
    }

    /// Whether any handler is bound to `event_name`.
    #[must_use]
    pub fn has_subscription(&self, event_name: &str) -> bool {
        self.state.lock().handlers.contains_key(event_name)
    }

    /// Whether any handler is bound to `E`.
    #[must_use]
    pub fn has_subscription_for<E: IntegrationEvent>(&self) -> bool {
        self.has_subscription(&self.event_key::<E>())
    }

    /// Bindings of `event_name` in registration order; empty if unknown.
    #[must_use]
    pub fn bindings_for(&self, event_name: &str) -> Vec<SubscriptionBinding> {
        self.state
            .lock()
            .handlers
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    /// The payload type registered for `event_name`.
    #[must_use]
    pub fn payload_type_for(&self, event_name: &str) -> Option<PayloadType> {
        self.state.lock().event_types.get(event_name).copied()
    }

    /// Payload type and bindings of `event_name`, read under one lock.
    pub(crate) fn dispatch_plan(
        &self,
        event_name: &str,
    ) -> Option<(PayloadType, Vec<SubscriptionBinding>)> {
        let state = self.state.lock();
        let payload_type = state.event_types.get(event_name).copied()?;
        let bindings = state.handlers.get(event_name)?.clone();

        Some((payload_type, bindings))
    }

    /// Whether no event names are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().handlers.is_empty()
    }

    /// Number of registered event names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().handlers.len()
    }

    /// Removes every binding, notifying once per event name.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.event_types.clear();

        for (event_name, _) in state.handlers.drain() {
            self.notify_removed(event_name);
        }
    }

    fn notify_removed(&self, event_name: String) {
        // The receiver lives as long as the owning bus.
        if self.removed.send(event_name).is_err() {
            debug!("removal notification dropped, receiver closed");
        }
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SubscriptionRegistry")
            .field("handlers", &state.handlers)
            .field("event_types", &state.event_types)
            .finish()
    }
}

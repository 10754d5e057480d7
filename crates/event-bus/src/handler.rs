use crate::event::{IntegrationEvent, short_type_name};

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// Type-erased handler instance handed out by a [`ResolveHandler`].
pub type HandlerInstance = Arc<dyn Any + Send + Sync>;

type HandlerFactory = Arc<dyn Fn() -> HandlerInstance + Send + Sync>;

/// Handles integration events of type `E`.
#[async_trait]
pub trait IntegrationEventHandler<E>
where
    Self: Send + Sync + 'static,
    E: IntegrationEvent,
{
    /// The error type for the handler.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Handles the given event.
    async fn handle(&self, event: E) -> Result<(), Self::Error>;
}

/// Identity of a handler type, used to keep bindings unique.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct HandlerType {
    id: TypeId,
    name: &'static str,
}

impl HandlerType {
    /// Returns the identity of `H`.
    #[must_use]
    pub fn of<H: 'static>() -> Self {
        Self {
            id: TypeId::of::<H>(),
            name: short_type_name::<H>(),
        }
    }

    /// The unqualified type name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The `TypeId` of the handler.
    #[must_use]
    pub const fn type_id(&self) -> TypeId {
        self.id
    }
}

impl fmt::Debug for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Resolves handler instances at dispatch time.
pub trait ResolveHandler: Send + Sync + 'static {
    /// Returns an instance of the handler type, or `None` if it is not
    /// registered. The instance must downcast to the concrete handler.
    fn resolve(&self, handler: HandlerType) -> Option<HandlerInstance>;
}

/// Default [`ResolveHandler`] built from per-type factories at wiring time.
///
/// Factories run once per delivery, so a handler may carry per-delivery state.
#[derive(Clone, Default)]
pub struct HandlerProvider {
    factories: HashMap<TypeId, HandlerFactory>,
}

impl HandlerProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory producing a fresh `H` per delivery.
    #[must_use]
    pub fn with_factory<H, F>(mut self, factory: F) -> Self
    where
        H: Send + Sync + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.factories.insert(
            TypeId::of::<H>(),
            Arc::new(move || Arc::new(factory()) as HandlerInstance),
        );
        self
    }

    /// Registers one shared `H` used for every delivery.
    #[must_use]
    pub fn with_instance<H>(mut self, handler: H) -> Self
    where
        H: Send + Sync + 'static,
    {
        let handler: HandlerInstance = Arc::new(handler);
        self.factories
            .insert(TypeId::of::<H>(), Arc::new(move || handler.clone()));
        self
    }

    /// Whether a factory for `H` is registered.
    #[must_use]
    pub fn contains<H: 'static>(&self) -> bool {
        self.factories.contains_key(&TypeId::of::<H>())
    }
}

impl fmt::Debug for HandlerProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerProvider")
            .field("handlers", &self.factories.len())
            .finish()
    }
}

impl ResolveHandler for HandlerProvider {
    fn resolve(&self, handler: HandlerType) -> Option<HandlerInstance> {
        self.factories.get(&handler.type_id()).map(|factory| factory())
    }
}

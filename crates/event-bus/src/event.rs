use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity and creation time shared by every integration event.
///
/// Embed it with `#[serde(flatten)]` so the wire record carries `id` and
/// `createdAt` next to the event-specific fields.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationEventMeta {
    /// Unique identifier of the event.
    pub id: Uuid,

    /// When the event was created.
    pub created_at: DateTime<Utc>,
}

impl IntegrationEventMeta {
    /// Creates metadata with a random id, stamped now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    /// Creates metadata with a known id and timestamp.
    #[must_use]
    pub const fn with(id: Uuid, created_at: DateTime<Utc>) -> Self {
        Self { id, created_at }
    }
}

impl Default for IntegrationEventMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// A serializable fact published by one service and consumed by others.
///
/// ```ignore
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// struct OrderCreatedIntegrationEvent {
///     #[serde(flatten)]
///     meta: IntegrationEventMeta,
///     order_id: u64,
/// }
///
/// impl IntegrationEvent for OrderCreatedIntegrationEvent {
///     fn meta(&self) -> &IntegrationEventMeta {
///         &self.meta
///     }
/// }
/// ```
pub trait IntegrationEvent
where
    Self: Clone + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    /// The event's identity and creation time.
    fn meta(&self) -> &IntegrationEventMeta;

    /// Unique identifier of the event.
    fn id(&self) -> Uuid {
        self.meta().id
    }

    /// When the event was created.
    fn created_at(&self) -> DateTime<Utc> {
        self.meta().created_at
    }

    /// The type name routing keys are derived from. Defaults to the
    /// unqualified Rust type name.
    #[must_use]
    fn type_name() -> &'static str {
        short_type_name::<Self>()
    }
}

/// `my_crate::events::OrderCreated<Foo>` becomes `OrderCreated`.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let without_generics = full.split('<').next().unwrap_or(full);

    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

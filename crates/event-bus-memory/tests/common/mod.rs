#![allow(dead_code)]

use std::convert::Infallible;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::{IntegrationEvent, IntegrationEventHandler, IntegrationEventMeta};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Polls `condition` until it holds, failing the test after 30 (virtual)
/// seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderCreatedIntegrationEvent {
    #[serde(flatten)]
    pub meta: IntegrationEventMeta,
    pub order_id: u64,
}

impl OrderCreatedIntegrationEvent {
    pub fn new(order_id: u64) -> Self {
        Self {
            meta: IntegrationEventMeta::new(),
            order_id,
        }
    }
}

impl IntegrationEvent for OrderCreatedIntegrationEvent {
    fn meta(&self) -> &IntegrationEventMeta {
        &self.meta
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrderPaidIntegrationEvent {
    #[serde(flatten)]
    pub meta: IntegrationEventMeta,
}

impl IntegrationEvent for OrderPaidIntegrationEvent {
    fn meta(&self) -> &IntegrationEventMeta {
        &self.meta
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Handled {
    pub handler: &'static str,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

pub type HandledReceiver = mpsc::UnboundedReceiver<Handled>;

pub fn handled_channel() -> (mpsc::UnboundedSender<Handled>, HandledReceiver) {
    mpsc::unbounded_channel()
}

macro_rules! recording_handler {
    ($name:ident) => {
        pub struct $name(pub mpsc::UnboundedSender<Handled>);

        #[async_trait]
        impl<E: IntegrationEvent> IntegrationEventHandler<E> for $name {
            type Error = Infallible;

            async fn handle(&self, event: E) -> Result<(), Self::Error> {
                let _ = self.0.send(Handled {
                    handler: stringify!($name),
                    id: event.id(),
                    created_at: event.created_at(),
                    payload: serde_json::to_value(&event).unwrap_or_default(),
                });
                Ok(())
            }
        }
    };
}

recording_handler!(Handler1);
recording_handler!(Handler2);

pub struct FailingHandler;

#[async_trait]
impl<E: IntegrationEvent> IntegrationEventHandler<E> for FailingHandler {
    type Error = io::Error;

    async fn handle(&self, _event: E) -> Result<(), Self::Error> {
        Err(io::Error::other("payment service down"))
    }
}

use crate::error::Error;

use async_trait::async_trait;
use bytes::Bytes;
use event_bus::BoxError;
use event_bus::transport::{Acknowledge, BrokerChannel, Delivery, DeliveryStream, QueueSpec};
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, ExchangeKind};
use tracing::trace;

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;
const CONTENT_TYPE: &str = "application/json";
const DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

/// An AMQP channel.
#[derive(Clone)]
pub struct RabbitMqChannel {
    inner: Channel,
}

impl RabbitMqChannel {
    pub(crate) const fn new(inner: Channel) -> Self {
        Self { inner }
    }
}

impl std::fmt::Debug for RabbitMqChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMqChannel")
            .field("id", &self.inner.id())
            .field("connected", &self.inner.status().connected())
            .finish()
    }
}

fn queue_arguments(queue: &QueueSpec) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(exchange) = &queue.dead_letter_exchange {
        arguments.insert(
            DEAD_LETTER_EXCHANGE.into(),
            AMQPValue::LongString(exchange.clone().into()),
        );
    }
    arguments
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<(), BoxError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| Box::new(Error::from(e)) as BoxError)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BoxError> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(|e| Box::new(Error::from(e)) as BoxError)
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery::new(
        delivery.routing_key.as_str(),
        Bytes::from(delivery.data),
        delivery.redelivered,
        LapinAcker(delivery.acker),
    )
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    type Error = Error;

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<(), Error> {
        self.inner
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), Error> {
        self.inner
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(queue),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), Error> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        self.inner
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<(), Error> {
        trace!(exchange, routing_key, size = payload.len(), "Publishing");

        // Without confirm mode the returned confirmation resolves immediately.
        let _confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type(CONTENT_TYPE.into()),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), Error> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, Error> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|item| {
                item.map(into_delivery)
                    .map_err(|e| Box::new(Error::from(e)) as BoxError)
            })
            .boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), Error> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        if !self.inner.status().connected() {
            return Ok(());
        }

        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use lapin::types::ShortString;

    #[test]
    fn test_dead_letter_exchange_argument() {
        let queue = QueueSpec::durable("Basket.API")
            .with_dead_letter_exchange(Some("EventBus.DeadLetter".to_string()));

        let arguments = queue_arguments(&queue);

        assert_eq!(
            arguments.inner().get(&ShortString::from(DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString("EventBus.DeadLetter".into()))
        );
    }

    #[test]
    fn test_no_arguments_without_dead_letter_exchange() {
        assert!(
            queue_arguments(&QueueSpec::durable("Basket.API"))
                .inner()
                .is_empty()
        );
    }
}

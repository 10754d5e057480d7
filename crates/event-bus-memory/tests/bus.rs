mod common;

use common::{
    FailingHandler, Handled, Handler1, Handler2, OrderCreatedIntegrationEvent,
    OrderPaidIntegrationEvent, eventually, handled_channel, init_logging,
};

use std::error::Error as _;
use std::time::Duration;

use assert_matches::assert_matches;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use event_bus::{
    ConsumeError, DeliveryFailurePolicy, Error, EventBus, EventBusConfig, HandlerProvider,
    IntegrationEvent, IntegrationEventMeta,
};
use event_bus_memory::{MemoryBroker, MemoryConnector};
use tokio::time::timeout;
use uuid::Uuid;

const QUEUE: &str = "BasketApi.OrderCreated";
const EXCHANGE: &str = "EventBus";

fn config() -> EventBusConfig {
    EventBusConfig {
        connection_retry_count: 3,
        subscriber_client_app_name: "BasketApi".to_string(),
        ..EventBusConfig::default()
    }
}

fn bus(
    broker: &MemoryBroker,
    config: EventBusConfig,
    provider: HandlerProvider,
) -> EventBus<MemoryConnector> {
    EventBus::new(config, MemoryConnector::new(broker.clone()), provider).unwrap()
}

async fn next(receiver: &mut common::HandledReceiver) -> Handled {
    timeout(Duration::from_secs(30), receiver.recv())
        .await
        .expect("handler not invoked in time")
        .expect("handler channel closed")
}

#[tokio::test(start_paused = true)]
async fn test_publish_reaches_subscribed_handler() {
    init_logging();
    let broker = MemoryBroker::new();
    let (sender, mut handled) = handled_channel();
    let bus = bus(
        &broker,
        config(),
        HandlerProvider::new().with_instance(Handler1(sender)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();

    assert!(broker.has_exchange(EXCHANGE));
    assert!(broker.is_bound(QUEUE, EXCHANGE, "OrderCreated"));
    let queue = broker.queue(QUEUE).unwrap();
    assert!(queue.durable && !queue.exclusive && !queue.auto_delete);
    assert!(bus.is_consuming("OrderCreated"));

    let id = Uuid::new_v4();
    let created_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
    let event = OrderCreatedIntegrationEvent {
        meta: IntegrationEventMeta::with(id, created_at),
        order_id: 7,
    };

    bus.publish(&event).await.unwrap();

    let received = next(&mut handled).await;
    assert_eq!(received.handler, "Handler1");
    assert_eq!(received.id, id);
    assert_eq!(received.created_at, created_at);
    assert_eq!(received.payload["order_id"], serde_json::json!(7));
    assert_eq!(received.payload, serde_json::to_value(&event).unwrap());

    eventually(|| broker.unacked_count(QUEUE) == 0 && broker.ready_count(QUEUE) == 0).await;
    assert!(handled.try_recv().is_err());
    assert!(broker.returned().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_publish_fails_when_broker_unreachable() {
    init_logging();
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let bus = bus(&broker, config(), HandlerProvider::new());

    let error = bus
        .publish(&OrderCreatedIntegrationEvent::new(1))
        .await
        .unwrap_err();

    assert_matches!(error, Error::Connection { .. });
    assert_eq!(
        error.to_string(),
        "Failed to publish event 'OrderCreated' after 3 retries."
    );
    assert_eq!(error.source().unwrap().to_string(), "broker unreachable");
    assert_eq!(broker.connect_attempts(), 3);
    assert!(!broker.has_exchange(EXCHANGE));
    assert!(broker.returned().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_publish_retries_transient_failures() {
    init_logging();
    let broker = MemoryBroker::new();
    let (sender, mut handled) = handled_channel();
    let bus = bus(
        &broker,
        config(),
        HandlerProvider::new().with_instance(Handler1(sender)),
    );
    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();

    broker.fail_next_publishes(2);
    let event = OrderCreatedIntegrationEvent::new(2);
    bus.publish(&event).await.unwrap();

    assert_eq!(next(&mut handled).await.id, event.id());
    assert!(handled.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_publish_gives_up_after_retry_count() {
    init_logging();
    let broker = MemoryBroker::new();
    let bus = bus(&broker, config(), HandlerProvider::new());

    broker.fail_next_publishes(10);
    let error = bus
        .publish(&OrderCreatedIntegrationEvent::new(3))
        .await
        .unwrap_err();

    assert_eq!(
        error.to_string(),
        "Failed to publish event 'OrderCreated' after 3 retries."
    );
    assert_eq!(error.source().unwrap().to_string(), "publish failed");
}

#[tokio::test(start_paused = true)]
async fn test_unbound_publish_is_returned() {
    init_logging();
    let broker = MemoryBroker::new();
    let bus = bus(&broker, config(), HandlerProvider::new());

    bus.publish(&OrderPaidIntegrationEvent {
        meta: IntegrationEventMeta::new(),
    })
    .await
    .unwrap();

    let returned = broker.returned();
    assert_eq!(returned.len(), 1);
    assert_eq!(returned[0].routing_key, "OrderPaid");
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_subscription_rejected() {
    init_logging();
    let broker = MemoryBroker::new();
    let (sender, _handled) = handled_channel();
    let bus = bus(
        &broker,
        config(),
        HandlerProvider::new().with_instance(Handler1(sender)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();
    let result = bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>().await;

    assert_matches!(
        result,
        Err(Error::DuplicateBinding { event_name, handler: "Handler1" }) if event_name == "OrderCreated"
    );
    assert_eq!(bus.registry().bindings_for("OrderCreated").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_requires_app_name() {
    init_logging();
    let broker = MemoryBroker::new();
    let bus = bus(
        &broker,
        EventBusConfig {
            subscriber_client_app_name: String::new(),
            ..config()
        },
        HandlerProvider::new(),
    );

    assert_matches!(
        bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>().await,
        Err(Error::Config(_))
    );
    assert!(bus.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_config_rejected() {
    let result = EventBus::new(
        EventBusConfig {
            connection_retry_count: 0,
            ..config()
        },
        MemoryConnector::new(MemoryBroker::new()),
        HandlerProvider::new(),
    );

    assert_matches!(result, Err(Error::Config(_)));
}

#[tokio::test(start_paused = true)]
async fn test_handlers_run_in_subscription_order() {
    init_logging();
    let broker = MemoryBroker::new();
    let (sender, mut handled) = handled_channel();
    let bus = bus(
        &broker,
        config(),
        HandlerProvider::new()
            .with_instance(Handler1(sender.clone()))
            .with_instance(Handler2(sender)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Handler2>()
        .await
        .unwrap();
    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();

    bus.publish(&OrderCreatedIntegrationEvent::new(4))
        .await
        .unwrap();

    assert_eq!(next(&mut handled).await.handler, "Handler2");
    assert_eq!(next(&mut handled).await.handler, "Handler1");
    assert_eq!(broker.consumer_count(QUEUE), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unresolvable_handler_is_skipped() {
    init_logging();
    let broker = MemoryBroker::new();
    let (sender, mut handled) = handled_channel();
    let bus = bus(
        &broker,
        config(),
        HandlerProvider::new().with_instance(Handler1(sender)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Handler2>()
        .await
        .unwrap();
    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();

    bus.publish(&OrderCreatedIntegrationEvent::new(5))
        .await
        .unwrap();

    assert_eq!(next(&mut handled).await.handler, "Handler1");
    eventually(|| broker.unacked_count(QUEUE) == 0 && broker.ready_count(QUEUE) == 0).await;
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_last_handler_unbinds_queue() {
    init_logging();
    let broker = MemoryBroker::new();
    let (sender, _handled) = handled_channel();
    let bus = bus(
        &broker,
        config(),
        HandlerProvider::new()
            .with_instance(Handler1(sender.clone()))
            .with_instance(Handler2(sender)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();
    bus.subscribe::<OrderCreatedIntegrationEvent, Handler2>()
        .await
        .unwrap();

    assert!(
        bus.unsubscribe::<OrderCreatedIntegrationEvent, Handler1>()
            .await
            .unwrap()
    );
    assert!(broker.is_bound(QUEUE, EXCHANGE, "OrderCreated"));
    assert!(bus.is_consuming("OrderCreated"));

    assert!(
        bus.unsubscribe::<OrderCreatedIntegrationEvent, Handler2>()
            .await
            .unwrap()
    );
    assert!(!broker.is_bound(QUEUE, EXCHANGE, "OrderCreated"));
    assert!(!bus.is_consuming("OrderCreated"));
    assert_eq!(broker.consumer_count(QUEUE), 0);
    assert!(broker.queue(QUEUE).is_some());

    assert!(
        !bus.unsubscribe::<OrderCreatedIntegrationEvent, Handler2>()
            .await
            .unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_after_unsubscribe() {
    init_logging();
    let broker = MemoryBroker::new();
    let (sender, mut handled) = handled_channel();
    let bus = bus(
        &broker,
        config(),
        HandlerProvider::new().with_instance(Handler1(sender)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();
    bus.unsubscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();
    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();

    assert!(broker.is_bound(QUEUE, EXCHANGE, "OrderCreated"));

    let event = OrderCreatedIntegrationEvent::new(6);
    bus.publish(&event).await.unwrap();

    assert_eq!(next(&mut handled).await.id, event.id());
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_all() {
    init_logging();
    let broker = MemoryBroker::new();
    let (sender, _handled) = handled_channel();
    let bus = bus(
        &broker,
        config(),
        HandlerProvider::new().with_instance(Handler1(sender)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();
    bus.subscribe::<OrderPaidIntegrationEvent, Handler1>()
        .await
        .unwrap();

    bus.unsubscribe_all().await.unwrap();

    assert!(bus.registry().is_empty());
    assert!(!broker.is_bound(QUEUE, EXCHANGE, "OrderCreated"));
    assert!(!broker.is_bound("BasketApi.OrderPaid", EXCHANGE, "OrderPaid"));
    assert!(!bus.is_consuming("OrderPaid"));
}

/// Subscribes `Handler1`, then unsubscribes it while the broker is down.
async fn unsubscribed_while_unreachable(broker: &MemoryBroker) -> EventBus<MemoryConnector> {
    let (sender, _handled) = handled_channel();
    let bus = bus(
        broker,
        config(),
        HandlerProvider::new().with_instance(Handler1(sender)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();

    broker.set_reachable(false);
    broker.sever_connections();

    assert_matches!(
        bus.unsubscribe::<OrderCreatedIntegrationEvent, Handler1>()
            .await,
        Err(Error::Connection { .. })
    );
    assert!(!bus.registry().has_subscription("OrderCreated"));
    assert!(!bus.is_consuming("OrderCreated"));
    assert!(broker.is_bound(QUEUE, EXCHANGE, "OrderCreated"));

    broker.set_reachable(true);
    bus
}

#[tokio::test(start_paused = true)]
async fn test_unbind_deferred_until_reconnect() {
    init_logging();
    let broker = MemoryBroker::new();
    let bus = unsubscribed_while_unreachable(&broker).await;

    bus.connect().await.unwrap();

    assert!(!broker.is_bound(QUEUE, EXCHANGE, "OrderCreated"));

    for order_id in 0..3 {
        bus.publish(&OrderCreatedIntegrationEvent::new(order_id))
            .await
            .unwrap();
    }

    assert_eq!(broker.ready_count(QUEUE), 0);
    assert_eq!(broker.consumer_count(QUEUE), 0);
    assert_eq!(broker.returned().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_publish_completes_deferred_unbind() {
    init_logging();
    let broker = MemoryBroker::new();
    let bus = unsubscribed_while_unreachable(&broker).await;

    bus.publish(&OrderCreatedIntegrationEvent::new(1))
        .await
        .unwrap();

    assert!(!broker.is_bound(QUEUE, EXCHANGE, "OrderCreated"));
    assert_eq!(broker.ready_count(QUEUE), 0);
    assert_eq!(broker.returned().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resubscribe_cancels_deferred_unbind() {
    init_logging();
    let broker = MemoryBroker::new();
    let bus = unsubscribed_while_unreachable(&broker).await;

    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();
    bus.connect().await.unwrap();

    assert!(broker.is_bound(QUEUE, EXCHANGE, "OrderCreated"));
    assert!(bus.is_consuming("OrderCreated"));
}

#[tokio::test(start_paused = true)]
async fn test_delivery_without_binding_is_acked_and_dropped() {
    init_logging();
    let broker = MemoryBroker::new();
    let (sender, mut handled) = handled_channel();
    let bus = bus(
        &broker,
        config(),
        HandlerProvider::new().with_instance(Handler1(sender)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();

    // Registry entry gone, queue and consumer still in place.
    assert!(
        bus.registry()
            .remove_subscription::<OrderCreatedIntegrationEvent, Handler1>()
    );

    bus.publish(&OrderCreatedIntegrationEvent::new(8))
        .await
        .unwrap();

    eventually(|| broker.unacked_count(QUEUE) == 0 && broker.ready_count(QUEUE) == 0).await;
    assert!(handled.try_recv().is_err());
    assert!(broker.dead_lettered().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_delivery_requeued_once_then_rejected() {
    init_logging();
    let broker = MemoryBroker::new();
    let bus = bus(
        &broker,
        config(),
        HandlerProvider::new().with_instance(FailingHandler),
    );
    let mut errors = bus.consume_errors();

    bus.subscribe::<OrderCreatedIntegrationEvent, FailingHandler>()
        .await
        .unwrap();
    bus.publish(&OrderCreatedIntegrationEvent::new(9))
        .await
        .unwrap();

    for _ in 0..2 {
        let error = timeout(Duration::from_secs(30), errors.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(error.event_name(), "OrderCreated");
        assert_matches!(
            &*error,
            ConsumeError::Handler { handler: "FailingHandler", .. }
        );
    }

    eventually(|| broker.dead_lettered().len() == 1).await;
    assert_eq!(broker.dead_lettered()[0].queue, QUEUE);
    assert_eq!(broker.unacked_count(QUEUE), 0);
    assert_eq!(broker.ready_count(QUEUE), 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_is_rejected() {
    init_logging();
    let broker = MemoryBroker::new();
    let (sender, mut handled) = handled_channel();
    let bus = bus(
        &broker,
        EventBusConfig {
            delivery_failure_policy: DeliveryFailurePolicy::Reject,
            ..config()
        },
        HandlerProvider::new().with_instance(Handler1(sender)),
    );
    let mut errors = bus.consume_errors();

    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();
    broker
        .publish(EXCHANGE, "OrderCreated", Bytes::from_static(b"not json"))
        .unwrap();

    let error = timeout(Duration::from_secs(30), errors.recv())
        .await
        .unwrap()
        .unwrap();

    assert_matches!(&*error, ConsumeError::Deserialize { event_name, .. } if event_name == "OrderCreated");
    eventually(|| broker.dead_lettered().len() == 1).await;
    assert!(handled.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_consumer_resumes_after_connection_loss() {
    init_logging();
    let broker = MemoryBroker::new();
    let (sender, mut handled) = handled_channel();
    let bus = bus(
        &broker,
        config(),
        HandlerProvider::new().with_instance(Handler1(sender)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();

    broker.sever_connections();
    assert_eq!(broker.consumer_count(QUEUE), 0);

    eventually(|| bus.connection().is_connected() && broker.consumer_count(QUEUE) == 1).await;

    let event = OrderCreatedIntegrationEvent::new(10);
    bus.publish(&event).await.unwrap();

    assert_eq!(next(&mut handled).await.id, event.id());
}

#[tokio::test(start_paused = true)]
async fn test_process_event_dispatches_directly() {
    init_logging();
    let broker = MemoryBroker::new();
    let (sender, mut handled) = handled_channel();
    let bus = bus(
        &broker,
        config(),
        HandlerProvider::new().with_instance(Handler1(sender)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();

    let event = OrderCreatedIntegrationEvent::new(11);
    let body = serde_json::to_vec(&event).unwrap();

    assert!(bus.process_event("OrderCreated", &body).await.unwrap());
    assert!(
        bus.process_event("OrderCreatedIntegrationEvent", &body)
            .await
            .unwrap()
    );
    assert!(!bus.process_event("OrderPaid", &body).await.unwrap());

    assert_eq!(next(&mut handled).await.id, event.id());
    assert_eq!(next(&mut handled).await.id, event.id());
}

#[tokio::test(start_paused = true)]
async fn test_dispose_stops_bus() {
    init_logging();
    let broker = MemoryBroker::new();
    let (sender, _handled) = handled_channel();
    let bus = bus(
        &broker,
        config(),
        HandlerProvider::new().with_instance(Handler1(sender)),
    );

    bus.subscribe::<OrderCreatedIntegrationEvent, Handler1>()
        .await
        .unwrap();

    bus.dispose().await;

    assert!(!bus.is_consuming("OrderCreated"));
    assert_eq!(broker.consumer_count(QUEUE), 0);
    assert_eq!(broker.open_connections(), 0);
    assert_matches!(
        bus.publish(&OrderCreatedIntegrationEvent::new(12)).await,
        Err(Error::Disposed)
    );
}

// tests/eventbus.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use mom_eventbus::transport::memory::{MemoryAmqp, MemoryLog, MemoryOrdered, MemoryPubSub};
use mom_eventbus::{
    // ---
    callback_fn,
    listener_fn,
    AmqpConfig,
    BoxError,
    Entity,
    EntityType,
    Envelope,
    EventBusConfig,
    EventBusError,
    EventContext,
    ListenerDescriptor,
    ListenerPtr,
    LogConfig,
    OrderedConfig,
    PubSubConfig,
    RegistryManager,
    RegistryManagerBuilder,
    SerializeMode,
    TransportKind,
};

const WAIT: Duration = Duration::from_secs(2);

/// Listener that forwards every envelope it handles.
fn collector(descriptor: ListenerDescriptor) -> (ListenerPtr, mpsc::UnboundedReceiver<Envelope>) {
    // ---
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = listener_fn(descriptor, move |_ctx, events| {
        let tx = tx.clone();
        async move {
            for event in events {
                let _ = tx.send(event);
            }
            Ok::<(), BoxError>(())
        }
    });
    (listener, rx)
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("listener channel closed")
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Envelope>) {
    let extra = timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(extra.is_err(), "unexpected extra delivery: {extra:?}");
}

fn text(topic: &str) -> ListenerDescriptor {
    ListenerDescriptor::new(topic).with_entity_type(EntityType::Text)
}

async fn pubsub_bus(broker: &Arc<MemoryPubSub>, listeners: Vec<ListenerPtr>) -> RegistryManager {
    // ---
    let mut config = EventBusConfig::default();
    config
        .pubsub
        .push(PubSubConfig::new("redis", "redis://memory").default_registry());

    let bus = RegistryManagerBuilder::new(config)
        .pubsub_client("redis", broker.clone())
        .listeners(listeners)
        .build()
        .await
        .expect("build failed");
    bus.start().await.expect("start failed");
    bus
}

#[tokio::test]
async fn disabled_transport_never_touches_the_wire() {
    // ---
    // Arrange
    // ---
    let broker = MemoryPubSub::new();
    let mut config = EventBusConfig::default();
    config
        .pubsub
        .push(PubSubConfig::new("redis", "redis://memory").default_registry());
    config.disabled.insert(TransportKind::PubSub);

    let bus = RegistryManagerBuilder::new(config)
        .pubsub_client("redis", broker.clone())
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    // ---
    // Act
    // ---
    let err = bus
        .publish("pubsub", Envelope::build("orders", "o-1"))
        .await
        .unwrap_err();
    let by_kind = bus
        .publish_kind(TransportKind::PubSub, Envelope::build("orders", "o-2"))
        .await
        .unwrap_err();

    // ---
    // Assert
    // ---
    assert!(matches!(err, EventBusError::DriverDisabled(_)));
    assert!(matches!(by_kind, EventBusError::DriverDisabled(_)));
    assert_eq!(broker.published_on("eventbus:orders"), 0);
    bus.close().await;
}

#[tokio::test]
async fn cumulative_confirm_settles_every_publish_in_order() {
    // ---
    // Arrange
    // ---
    let broker = MemoryAmqp::manual_confirms();
    let mut config = EventBusConfig::default();
    config
        .amqp
        .push(AmqpConfig::new("rabbit", "amqp://memory").default_registry());

    let bus = RegistryManagerBuilder::new(config)
        .amqp_connection("rabbit", broker.clone())
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    let (tx, mut confirmed) = mpsc::unbounded_channel();

    // ---
    // Act
    // ---
    for i in 1..=5 {
        let tx = tx.clone();
        let envelope = Envelope::build("orders", format!("o-{i}")).with_callback(callback_fn(
            move |ok| {
                let _ = tx.send(ok.message_id);
            },
            |_, err| panic!("unexpected failure: {err}"),
        ));
        bus.publish("acked-queue", envelope).await.unwrap();
    }
    assert!(confirmed.try_recv().is_err());
    broker.confirm(5, true, true);

    // ---
    // Assert
    // ---
    let mut ids = Vec::new();
    for _ in 0..5 {
        let id = timeout(WAIT, confirmed.recv()).await.unwrap().unwrap();
        ids.push(id.unwrap());
    }
    assert_eq!(ids, vec!["1", "2", "3", "4", "5"]);
    assert_eq!(broker.published("orders"), 5);
    bus.close().await;
}

#[tokio::test]
async fn unconfirmed_publishes_fail_on_close() {
    // ---
    let broker = MemoryAmqp::manual_confirms();
    let mut config = EventBusConfig::default();
    config
        .amqp
        .push(AmqpConfig::new("rabbit", "amqp://memory").default_registry());
    let bus = RegistryManagerBuilder::new(config)
        .amqp_connection("rabbit", broker.clone())
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    let (tx, mut failed) = mpsc::unbounded_channel();
    let envelope = Envelope::build("orders", "o-1").with_callback(callback_fn(
        |_| panic!("nothing was confirmed"),
        move |_, err| {
            let _ = tx.send(err);
        },
    ));
    bus.publish("rabbit", envelope).await.unwrap();
    bus.close().await;

    let err = timeout(WAIT, failed.recv()).await.unwrap().unwrap();
    assert!(matches!(err, EventBusError::LedgerClosed(1)));
}

#[tokio::test]
async fn amqp_round_trip_through_declared_queue() {
    // ---
    let broker = MemoryAmqp::new();
    let mut config = EventBusConfig::default();
    config
        .amqp
        .push(AmqpConfig::new("rabbit", "amqp://memory").default_registry());

    let (listener, mut rx) = collector(text("orders").with_group("billing"));
    let bus = RegistryManagerBuilder::new(config)
        .amqp_connection("rabbit", broker.clone())
        .listener(listener)
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    bus.publish("acked-queue", Envelope::build("orders", "o-1").with_async(false))
        .await
        .unwrap();

    let got = next(&mut rx).await;
    assert_eq!(got.entity, Entity::Text("o-1".into()));
    assert_eq!(got.group(), "billing");
    assert_eq!(got.drive_type.unwrap().to_string(), "rabbit#acked-queue");
    bus.close().await;
}

#[tokio::test]
async fn empty_log_record_is_skipped() {
    // ---
    // Arrange
    // ---
    let broker = MemoryLog::new();
    let mut config = EventBusConfig::default();
    let mut log = LogConfig::new("kafka", "memory:9092").default_registry();
    log.group_id = "svc".into();
    log.poll_timeout = Duration::from_millis(50);
    config.log.push(log);

    let (listener, mut rx) = collector(text("audit"));
    let bus = RegistryManagerBuilder::new(config)
        .log_client("kafka", broker.clone())
        .listener(listener)
        .build()
        .await
        .unwrap();

    // ---
    // Act
    // ---
    broker.append("audit", None, "");
    bus.start().await.unwrap();
    bus.publish("log-queue", Envelope::build("audit", "login").with_async(false))
        .await
        .unwrap();

    // ---
    // Assert
    // ---
    let got = next(&mut rx).await;
    assert_eq!(got.entity, Entity::Text("login".into()));
    assert_quiet(&mut rx).await;
    assert_eq!(broker.records("audit"), 2);
    bus.close().await;
}

#[tokio::test]
async fn each_group_receives_a_pubsub_event_once() {
    // ---
    // Arrange
    // ---
    let broker = MemoryPubSub::new();
    let (billing, mut billing_rx) = collector(text("orders").with_group("billing"));
    let (shipping, mut shipping_rx) = collector(text("orders").with_group("shipping"));
    let bus = pubsub_bus(&broker, vec![billing, shipping]).await;

    // ---
    // Act
    // ---
    bus.publish("redis", Envelope::build("orders", "o-1")).await.unwrap();

    // ---
    // Assert
    // ---
    let b = next(&mut billing_rx).await;
    let s = next(&mut shipping_rx).await;
    assert_eq!(b.event_id(), s.event_id());
    assert_eq!(b.group(), "billing");
    assert_eq!(s.group(), "shipping");
    assert_quiet(&mut billing_rx).await;
    assert_quiet(&mut shipping_rx).await;
    bus.close().await;
}

#[tokio::test]
async fn wire_group_selects_the_log_listener() {
    // ---
    let broker = MemoryLog::new();
    let mut config = EventBusConfig::default();
    let mut log = LogConfig::new("kafka", "memory:9092").default_registry();
    log.poll_timeout = Duration::from_millis(50);
    config.log.push(log);

    let (a, mut a_rx) = collector(text("audit").with_group("a"));
    let (b, mut b_rx) = collector(text("audit").with_group("b"));
    let bus = RegistryManagerBuilder::new(config)
        .log_client("kafka", broker.clone())
        .listeners([a, b])
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    bus.publish("kafka", Envelope::build("audit", "x").with_group("a"))
        .await
        .unwrap();
    bus.publish("kafka", Envelope::build("audit", "y").with_group("b"))
        .await
        .unwrap();

    // group on the wire decides which listener handles the event
    assert_eq!(next(&mut a_rx).await.entity, Entity::Text("x".into()));
    assert_eq!(next(&mut b_rx).await.entity, Entity::Text("y".into()));
    assert_quiet(&mut a_rx).await;
    assert_quiet(&mut b_rx).await;
    bus.close().await;
}

#[tokio::test]
async fn ordered_push_consumer_receives_published_event() {
    // ---
    let broker = MemoryOrdered::new(4);
    let mut config = EventBusConfig::default();
    let mut ordered = OrderedConfig::new("rocket", "memory:9876").default_registry();
    ordered.producer_group_id = "pg".into();
    config.ordered.push(ordered);

    let (listener, mut rx) = collector(text("payments"));
    let bus = RegistryManagerBuilder::new(config)
        .ordered_client("rocket", broker.clone())
        .listener(listener)
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    let ctx = EventContext::with_trace_id("trace-7");
    bus.publish_with_context(&ctx, "ordered-queue", Envelope::build("payments", "p-1").with_async(false))
        .await
        .unwrap();

    let got = next(&mut rx).await;
    assert_eq!(got.event_id(), "trace-7");
    assert_eq!(got.entity, Entity::Text("p-1".into()));
    assert_eq!(broker.stored("payments"), 1);
    bus.close().await;
}

#[tokio::test]
async fn local_sync_reports_through_callback() {
    // ---
    let (listener, mut rx) = collector(ListenerDescriptor::new("audit").with_registry("local-sync"));
    let bus = RegistryManagerBuilder::new(EventBusConfig::default())
        .listener(listener)
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    let (tx, mut results) = mpsc::unbounded_channel();
    let envelope = Envelope::build("audit", "login")
        .with_event_id("e-1")
        .with_async(false)
        .with_callback(callback_fn(
            move |ok| {
                let _ = tx.send(ok.message_id);
            },
            |_, err| panic!("unexpected failure: {err}"),
        ));
    bus.publish("local-sync", envelope).await.unwrap();

    // dispatch is complete when publish returns
    let got = rx.try_recv().expect("listener ran on the publishing task");
    assert_eq!(got.event_id(), "e-1");
    assert_eq!(results.try_recv().unwrap(), Some("e-1".to_string()));
    bus.close().await;
}

#[tokio::test]
async fn async_failure_is_wrapped_and_sync_failure_is_not() {
    // ---
    let failing = listener_fn(ListenerDescriptor::new("audit"), |_ctx, _events| async {
        Err::<(), BoxError>("rejected".into())
    });
    let bus = RegistryManagerBuilder::new(EventBusConfig::default())
        .listener(failing)
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    let sync = bus
        .publish("local-sync", Envelope::build("audit", "x").with_async(false))
        .await
        .unwrap_err();
    assert!(matches!(sync, EventBusError::ListenerBusiness { .. }));

    let wrapped = bus
        .publish("local-sync", Envelope::build("audit", "x"))
        .await
        .unwrap_err();
    assert!(matches!(wrapped, EventBusError::Publish { .. }));
    bus.close().await;
}

#[tokio::test]
async fn publish_errors_for_missing_envelope_and_unknown_registry() {
    // ---
    let bus = RegistryManagerBuilder::new(EventBusConfig::default())
        .build()
        .await
        .unwrap();

    let nil = bus.publish("local-sync", None).await.unwrap_err();
    assert!(matches!(nil, EventBusError::PublishEventNil));

    let missing = bus
        .publish("acked-queue", Envelope::build("t", "x"))
        .await
        .unwrap_err();
    assert!(matches!(missing, EventBusError::DriverNotFound(_)));
}

#[tokio::test]
async fn json_entity_round_trips_over_pubsub() {
    // ---
    let broker = MemoryPubSub::new();
    let (listener, mut rx) = collector(
        ListenerDescriptor::new("orders")
            .with_entity_type(EntityType::Json)
            .with_serialize_mode(SerializeMode::Json),
    );
    let bus = pubsub_bus(&broker, vec![listener]).await;

    let value = serde_json::json!({"id": 7, "items": ["a", "b"]});
    bus.publish(
        "pubsub",
        Envelope::build("orders", Entity::Json(value.clone())).with_serialize_mode(SerializeMode::Json),
    )
    .await
    .unwrap();

    let got = next(&mut rx).await;
    assert_eq!(got.entity, Entity::Json(value));
    assert_eq!(got.topic(), "orders");
    bus.close().await;
}

#[tokio::test]
async fn basic_bytes_round_trip_over_pubsub() {
    // ---
    let broker = MemoryPubSub::new();
    let (listener, mut rx) = collector(
        ListenerDescriptor::new("blobs")
            .with_entity_type(EntityType::Bytes)
            .with_serialize_mode(SerializeMode::Basic),
    );
    let bus = pubsub_bus(&broker, vec![listener]).await;

    let payload = bytes::Bytes::from_static(&[0, 159, 146, 150]);
    bus.publish(
        "pubsub",
        Envelope::build("blobs", Entity::Bytes(payload.clone())).with_serialize_mode(SerializeMode::Basic),
    )
    .await
    .unwrap();

    let got = next(&mut rx).await;
    assert_eq!(got.entity, Entity::Bytes(payload.clone()));
    assert_eq!(got.raw_bytes, Some(payload));
    bus.close().await;
}

#[tokio::test]
async fn double_close_is_harmless() {
    // ---
    let broker = MemoryPubSub::new();
    let (listener, _rx) = collector(text("orders"));
    let bus = pubsub_bus(&broker, vec![listener]).await;
    assert!(bus.is_running());

    bus.close().await;
    bus.clone().close().await;
    assert!(!bus.is_running());

    let err = bus
        .publish("redis", Envelope::build("orders", "late"))
        .await
        .unwrap_err();
    assert!(matches!(err, EventBusError::Publish { .. }));
}

#[tokio::test]
async fn basic_message_reaches_listener_through_explicit_exchange() {
    // ---
    // Arrange
    // ---
    let broker = MemoryAmqp::new();
    let mut config = EventBusConfig::default();
    config
        .amqp
        .push(AmqpConfig::new("rabbit", "amqp://memory").default_registry());

    let descriptor = text("orders")
        .with_queue("q1")
        .with_exchange("ex", "direct")
        .with_serialize_mode(SerializeMode::Basic);
    let (listener, mut rx) = collector(descriptor);
    let bus = RegistryManagerBuilder::new(config)
        .amqp_connection("rabbit", broker.clone())
        .listener(listener)
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    // ---
    // Act
    // ---
    let envelope = Envelope::build("ex", "hello")
        .with_serialize_mode(SerializeMode::Basic)
        .with_async(false);
    bus.publish("rabbit", envelope).await.unwrap();

    // ---
    // Assert
    // ---
    let got = next(&mut rx).await;
    assert_eq!(got.topic(), "orders");
    assert_eq!(got.entity, Entity::Text("hello".into()));
    assert_eq!(broker.published("ex"), 1);
    assert_quiet(&mut rx).await;
    assert_eq!(broker.unacked("q1"), 0);
    bus.close().await;
}

#[tokio::test]
async fn empty_topic_uses_log_default_topic() {
    // ---
    let broker = MemoryLog::new();
    let mut config = EventBusConfig::default();
    let mut log = LogConfig::new("kafka", "memory:9092")
        .default_registry()
        .topic("fallback");
    log.group_id = "svc".into();
    log.poll_timeout = Duration::from_millis(50);
    config.log.push(log);

    let (listener, mut rx) = collector(text(""));
    let bus = RegistryManagerBuilder::new(config)
        .log_client("kafka", broker.clone())
        .listener(listener)
        .build()
        .await
        .unwrap();
    bus.start().await.unwrap();

    bus.publish("kafka", Envelope::build("", "x").with_async(false))
        .await
        .unwrap();

    let got = next(&mut rx).await;
    assert_eq!(got.topic(), "");
    assert_eq!(got.entity, Entity::Text("x".into()));
    bus.close().await;
}

#[tokio::test]
async fn empty_topic_uses_registry_channel_on_pubsub() {
    // ---
    let broker = MemoryPubSub::new();
    let (listener, mut rx) = collector(text(""));
    let bus = pubsub_bus(&broker, vec![listener]).await;

    bus.publish("redis", Envelope::build("", "x").with_async(false))
        .await
        .unwrap();

    let got = next(&mut rx).await;
    assert_eq!(got.topic(), "");
    assert_eq!(got.entity, Entity::Text("x".into()));
    assert_quiet(&mut rx).await;
    bus.close().await;
}

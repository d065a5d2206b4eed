// src/transport/amqp/registry.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use super::{
    // ---
    AmqpChannelPtr,
    AmqpConnectionPtr,
    ConfirmListener,
    Delivery,
    ExchangeBinding,
};
use crate::config::AmqpConfig;
use crate::ledger::ConfirmLedger;
use crate::router::ConsumerRouter;
use crate::serializer::SerializerPtr;
use crate::sync::lock_ignore_poison;
use crate::transport::{guard, report, Decoder, Inbound, LoopSet};
use crate::{
    // ---
    Envelope,
    EventBusError,
    EventCallback,
    EventResult,
    ListenerDescriptor,
    ListenerPtr,
    NativeMessage,
    NativeResult,
    Registry,
    RegistryBase,
    Result,
    TransportKind,
};

/// Routes broker confirms of the producer channel into its ledger.
struct LedgerConfirms(Arc<ConfirmLedger>);

impl ConfirmListener for LedgerConfirms {
    // ---
    fn handle_ack(&self, seq: u64, multiple: bool) {
        // ---
        if multiple {
            self.0.settle(seq, true);
        } else {
            self.0.settle_one(seq, true);
        }
    }

    fn handle_nack(&self, seq: u64, multiple: bool) {
        // ---
        if multiple {
            self.0.settle(seq, false);
        } else {
            self.0.settle_one(seq, false);
        }
    }
}

/// Ledger callback that hands a synchronous publish its confirm.
struct ConfirmSignal(Mutex<Option<oneshot::Sender<Result<EventResult>>>>);

impl ConfirmSignal {
    fn send(&self, outcome: Result<EventResult>) {
        if let Some(tx) = lock_ignore_poison(&self.0).take() {
            let _ = tx.send(outcome);
        }
    }
}

impl EventCallback for ConfirmSignal {
    // ---
    fn on_success(&self, result: EventResult) {
        self.send(Ok(result));
    }

    fn on_failure(&self, _result: EventResult, error: EventBusError) {
        self.send(Err(error));
    }
}

struct Producer {
    channel: AmqpChannelPtr,
    ledger: Arc<ConfirmLedger>,
    // sequence lookup and wire write must not interleave
    publish_lock: tokio::sync::Mutex<()>,
}

/// Acked-queue registry over an [`AmqpConnection`](super::AmqpConnection).
pub struct AmqpRegistry {
    base: RegistryBase,
    config: AmqpConfig,
    connection: AmqpConnectionPtr,
    serializer: SerializerPtr,
    decoder: Decoder,
    router: ConsumerRouter,
    producer: Option<Producer>,
    consumers: Mutex<Vec<AmqpChannelPtr>>,
    loops: LoopSet,
    closed: AtomicBool,
}

fn first_non_empty<'a>(candidates: &[&'a str]) -> &'a str {
    candidates.iter().copied().find(|s| !s.is_empty()).unwrap_or("")
}

impl AmqpRegistry {
    // ---
    /// Build the registry; opens the producer channel in confirm mode unless
    /// `skip_create_producer` is set.
    pub async fn new(
        config: &AmqpConfig,
        connection: AmqpConnectionPtr,
        serializer: SerializerPtr,
    ) -> Result<Arc<Self>> {
        // ---
        config.validate()?;
        let base = RegistryBase::new(config.name.as_str(), TransportKind::AckedQueue, config.is_default);
        let decoder = Decoder::new(serializer.clone(), base.drive_type()?);

        let producer = if config.skip_create_producer {
            None
        } else {
            let channel = connection.create_channel().await?;
            let ledger = ConfirmLedger::spawn(format!("{}:producer", config.name));
            channel
                .confirm_select(Arc::new(LedgerConfirms(ledger.clone())))
                .await?;
            Some(Producer {
                channel,
                ledger,
                publish_lock: tokio::sync::Mutex::new(()),
            })
        };

        Ok(Arc::new(Self {
            router: ConsumerRouter::new(config.name.as_str(), TransportKind::AckedQueue),
            loops: LoopSet::new(config.name.as_str()),
            config: config.clone(),
            base,
            connection,
            serializer,
            decoder,
            producer,
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    /// Consumer binding for a listener.
    ///
    /// Explicit listener fields win, then registry config; otherwise
    /// `exchange = topic`, `queue = group`, `routing_key = tags`. An empty
    /// routing key falls back to the exchange name.
    pub fn binding(&self, descriptor: &ListenerDescriptor) -> ExchangeBinding {
        // ---
        let d = descriptor;
        let c = &self.config;
        let exchange = first_non_empty(&[d.exchange.as_str(), c.exchange.as_str(), d.topic.as_str()]);
        let queue = first_non_empty(&[d.queue.as_str(), c.queue.as_str(), d.group.as_str()]);
        let routing_key = first_non_empty(&[
            d.routing_key.as_str(),
            c.routing_key.as_str(),
            d.tags.as_str(),
            exchange,
        ]);

        ExchangeBinding {
            exchange: exchange.to_string(),
            exchange_type: first_non_empty(&[d.exchange_type.as_str(), c.exchange_type.as_str()])
                .to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            durable: descriptor.durable,
            auto_delete: descriptor.auto_delete,
        }
    }

    /// Exchange and routing key a publish of `envelope` goes to.
    pub fn route_of(&self, envelope: &Envelope) -> (String, String) {
        // ---
        let exchange = first_non_empty(&[envelope.topic(), self.config.exchange.as_str()]);
        let routing_key = first_non_empty(&[envelope.tags(), self.config.routing_key.as_str(), exchange]);
        (exchange.to_string(), routing_key.to_string())
    }

    /// Outstanding asynchronous publishes awaiting a confirm.
    pub fn outstanding(&self) -> usize {
        self.producer.as_ref().map_or(0, |p| p.ledger.outstanding())
    }

    async fn publish_sync(&self, producer: &Producer, envelope: &Envelope, payload: Bytes) -> Result<EventResult> {
        // ---
        let (exchange, routing_key) = self.route_of(envelope);
        let (tx, rx) = oneshot::channel();
        let signal: Arc<dyn EventCallback> = Arc::new(ConfirmSignal(Mutex::new(Some(tx))));

        let seq = {
            let _guard = producer.publish_lock.lock().await;
            let seq = producer.channel.next_publish_seq();
            producer.ledger.track(seq, Some(signal), envelope.topic.clone())?;

            if let Err(e) = producer.channel.basic_publish(&exchange, &routing_key, payload).await {
                producer.ledger.fail(seq, EventBusError::Transport(e.to_string()));
                return Err(e);
            }
            seq
        };
        crate::log_trace!("[{}] published seq={seq} to {exchange}/{routing_key}", self.base.name);

        match tokio::time::timeout(self.config.confirm_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(EventBusError::Closed),
            Err(_) => Err(EventBusError::Transport(format!(
                "no broker confirm for seq={seq} within {:?}",
                self.config.confirm_timeout
            ))),
        }
    }

    async fn publish_async(&self, producer: &Producer, envelope: &Envelope, payload: Bytes) -> Result<()> {
        // ---
        let (exchange, routing_key) = self.route_of(envelope);
        let _guard = producer.publish_lock.lock().await;

        let seq = producer.channel.next_publish_seq();
        producer
            .ledger
            .track(seq, envelope.callback.clone(), envelope.topic.clone())?;

        if let Err(e) = producer.channel.basic_publish(&exchange, &routing_key, payload).await {
            let message = e.to_string();
            producer.ledger.fail(seq, e);
            if envelope.callback.is_none() {
                return Err(EventBusError::Transport(message));
            }
        }
        Ok(())
    }

    async fn consume_loop(
        listener: ListenerPtr,
        channel: AmqpChannelPtr,
        mut rx: mpsc::Receiver<Delivery>,
        mut shutdown: watch::Receiver<bool>,
        decoder: Decoder,
        router: ConsumerRouter,
    ) {
        // ---
        let descriptor = listener.descriptor().clone();

        loop {
            let delivery = tokio::select! {
                _ = shutdown.changed() => break,
                d = rx.recv() => match d {
                    Some(d) => d,
                    None => break,
                },
            };
            let tag = delivery.delivery_tag;

            let inbound = Inbound::new(delivery.body.clone())
                .topic(delivery.exchange.clone())
                .native(NativeMessage::new(delivery));

            let handled = match decoder.decode(&descriptor, inbound) {
                // empty body: discard
                None => Ok(()),
                Some(envelope) => router.route_to(&listener, vec![envelope]).await,
            };

            match handled {
                Ok(()) => {
                    if let Err(_e) = channel.basic_ack(tag).await {
                        crate::log_error!("[{}] ack of delivery {tag} failed: {_e}", decoder.drive_type());
                    }
                }
                Err(_e) => {
                    crate::log_warn!(
                        "[{}] {} left delivery {tag} unacked: {_e}",
                        decoder.drive_type(),
                        descriptor.name
                    );
                }
            }
        }

        crate::log_debug!("[{}] consumer {} stopped", decoder.drive_type(), descriptor.name);
    }
}

#[async_trait::async_trait]
impl Registry for AmqpRegistry {
    // ---
    fn base(&self) -> &RegistryBase {
        &self.base
    }

    async fn init_registry_listeners(&self, all: &[ListenerPtr]) -> Result<()> {
        // ---
        for listener in self.base.bound(all) {
            let binding = self.binding(listener.descriptor());
            let channel = self.connection.create_channel().await?;
            lock_ignore_poison(&self.consumers).push(channel.clone());

            channel.declare(&binding).await?;
            let consumer_tag = format!("{}-{}", self.base.name, listener.descriptor().name);
            let rx = channel.basic_consume(&binding.queue, &consumer_tag).await?;
            crate::log_info!(
                "[{}] {} consuming {} bound to {}/{}",
                self.base.name,
                listener.descriptor().name,
                binding.queue,
                binding.exchange,
                binding.routing_key
            );

            self.loops.spawn(Self::consume_loop(
                listener,
                channel,
                rx,
                self.loops.signal(),
                self.decoder.clone(),
                self.router.clone(),
            ));
        }
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        // ---
        if self.closed.load(Ordering::Acquire) {
            return Err(EventBusError::Closed);
        }

        let callback = guard(&envelope);
        let failed = || {
            EventResult::new(
                envelope.event_id.clone(),
                envelope.topic.clone(),
                NativeResult::Confirm { ack: false },
            )
        };

        let Some(producer) = self.producer.as_ref() else {
            let err = EventBusError::DriverInit(format!(
                "registry {} was created without a producer",
                self.base.name
            ));
            return report(callback.as_ref(), Err(err), failed);
        };

        let payload = match self.serializer.serialize(&envelope) {
            Ok(payload) => payload,
            Err(e) => return report(callback.as_ref(), Err(e), failed),
        };

        if envelope.enable_async {
            // the ledger owns the callback from here
            return self.publish_async(producer, &envelope, payload).await;
        }

        let outcome = self.publish_sync(producer, &envelope, payload).await;
        if let Err(_e) = &outcome {
            crate::log_warn!("[{}] confirmed publish failed: {_e}", self.base.name);
        }
        report(callback.as_ref(), outcome, failed)
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.loops.shutdown().await;
        let consumers = std::mem::take(&mut *lock_ignore_poison(&self.consumers));
        for channel in consumers {
            if let Err(_e) = channel.close().await {
                crate::log_warn!("[{}] consumer channel close failed: {_e}", self.base.name);
            }
        }

        if let Some(producer) = &self.producer {
            producer.ledger.close(self.config.drain_timeout).await;
            if let Err(_e) = producer.channel.close().await {
                crate::log_warn!("[{}] producer channel close failed: {_e}", self.base.name);
            }
        }

        if let Err(_e) = self.connection.close().await {
            crate::log_warn!("[{}] connection close failed: {_e}", self.base.name);
        }
        crate::log_info!("[{}] closed", self.base.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::serializer::DefaultSerializer;
    use crate::transport::memory::MemoryAmqp;
    use crate::{callback_fn, listener_fn};
    use std::time::Duration;

    async fn registry(broker: &Arc<MemoryAmqp>, config: AmqpConfig) -> Arc<AmqpRegistry> {
        AmqpRegistry::new(&config, broker.clone(), DefaultSerializer::shared())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn compat_binding_maps_topic_group_and_tags() {
        // ---
        let broker = MemoryAmqp::new();
        let reg = registry(&broker, AmqpConfig::new("mq", "memory://")).await;

        let plain = ListenerDescriptor::new("orders").with_group("billing");
        let b = reg.binding(&plain);
        assert_eq!(b.exchange, "orders");
        assert_eq!(b.queue, "billing");
        assert_eq!(b.routing_key, "orders");
        assert_eq!(b.exchange_type, "direct");

        let tagged = ListenerDescriptor::new("orders")
            .with_tags("eu")
            .with_queue("q1")
            .with_exchange("ex", "topic");
        let b = reg.binding(&tagged);
        assert_eq!((b.exchange.as_str(), b.queue.as_str()), ("ex", "q1"));
        assert_eq!(b.routing_key, "eu");
        assert_eq!(b.exchange_type, "topic");
    }

    #[tokio::test]
    async fn sync_publish_waits_for_confirm() {
        // ---
        let broker = MemoryAmqp::new();
        let reg = registry(&broker, AmqpConfig::new("mq", "memory://")).await;

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let env = Envelope::build("orders", "o-1")
            .with_async(false)
            .with_callback(callback_fn(
                move |r| *s.lock().unwrap() = Some(r),
                |_, e| panic!("unexpected failure: {e}"),
            ));
        reg.publish(env).await.unwrap();

        let result = seen.lock().unwrap().clone().unwrap();
        assert_eq!(result.message_id.as_deref(), Some("1"));
        assert_eq!(result.native, NativeResult::Confirm { ack: true });
        reg.close().await.unwrap();
    }

    #[tokio::test]
    async fn failed_handler_leaves_delivery_unacked() {
        // ---
        let broker = MemoryAmqp::new();
        let reg = registry(&broker, AmqpConfig::new("mq", "memory://").default_registry()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = listener_fn(ListenerDescriptor::new("orders"), move |_, events| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(events.len());
                Err::<(), crate::error::BoxError>("nope".into())
            }
        });
        reg.init_registry_listeners(&[listener]).await.unwrap();

        reg.publish(Envelope::build("orders", "x").with_async(false))
            .await
            .unwrap();
        let n = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 1);

        tokio::task::yield_now().await;
        assert_eq!(broker.unacked("DEFAULT"), 1);
        reg.close().await.unwrap();
    }

    #[tokio::test]
    async fn consume_only_registry_rejects_publish() {
        // ---
        let broker = MemoryAmqp::new();
        let reg = registry(&broker, AmqpConfig::new("mq", "memory://").skip_create_producer(true)).await;

        let err = reg.publish(Envelope::build("orders", "x")).await.unwrap_err();
        assert!(matches!(err, EventBusError::DriverInit(_)));
    }
}

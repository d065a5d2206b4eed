// src/transport/pubsub/registry.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::{PubSubClientPtr, PubSubMessage};
use crate::config::PubSubConfig;
use crate::router::ConsumerRouter;
use crate::serializer::SerializerPtr;
use crate::transport::{guard, report, Decoder, Inbound, LoopSet};
use crate::{
    // ---
    Envelope,
    EventBusError,
    EventResult,
    ListenerPtr,
    NativeMessage,
    NativeResult,
    Registry,
    RegistryBase,
    Result,
    TransportKind,
};

/// Messages drained into one routed batch.
const MAX_BATCH: usize = 32;

/// Pub/sub registry over a [`PubSubClient`](super::PubSubClient).
pub struct PubSubRegistry {
    base: RegistryBase,
    prefix: String,
    client: PubSubClientPtr,
    serializer: SerializerPtr,
    decoder: Decoder,
    router: ConsumerRouter,
    loops: LoopSet,
    closed: AtomicBool,
}

impl PubSubRegistry {
    // ---
    pub fn new(
        config: &PubSubConfig,
        client: PubSubClientPtr,
        serializer: SerializerPtr,
    ) -> Result<Arc<Self>> {
        // ---
        config.validate()?;
        let base = RegistryBase::new(config.name.as_str(), TransportKind::PubSub, config.is_default);
        let decoder = Decoder::new(serializer.clone(), base.drive_type()?);

        Ok(Arc::new(Self {
            router: ConsumerRouter::new(config.name.as_str(), TransportKind::PubSub),
            loops: LoopSet::new(config.name.as_str()),
            prefix: config.channel_prefix.clone(),
            base,
            client,
            serializer,
            decoder,
            closed: AtomicBool::new(false),
        }))
    }

    /// Channel for `topic`, falling back to the registry name.
    pub fn channel(&self, topic: &str) -> String {
        // ---
        if topic.is_empty() {
            format!("{}{}", self.prefix, self.base.name)
        } else {
            format!("{}{topic}", self.prefix)
        }
    }

    async fn receive_loop(
        listener: ListenerPtr,
        mut rx: mpsc::Receiver<PubSubMessage>,
        mut shutdown: watch::Receiver<bool>,
        prefix: String,
        decoder: Decoder,
        router: ConsumerRouter,
    ) {
        // ---
        let descriptor = listener.descriptor().clone();
        crate::log_debug!("[{}] receive loop started for {}", decoder.drive_type(), descriptor.name);

        loop {
            let first = tokio::select! {
                _ = shutdown.changed() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let mut messages = vec![first];
            while messages.len() < MAX_BATCH {
                match rx.try_recv() {
                    Ok(msg) => messages.push(msg),
                    Err(_) => break,
                }
            }

            let batch: Vec<Envelope> = messages
                .into_iter()
                .filter_map(|msg| {
                    let topic = msg
                        .channel
                        .strip_prefix(prefix.as_str())
                        .unwrap_or(&msg.channel)
                        .to_string();
                    let inbound = Inbound::new(msg.payload.clone())
                        .topic(topic)
                        .native(NativeMessage::new(msg));
                    decoder.decode(&descriptor, inbound)
                })
                .collect();

            if let Err(_e) = router.route_to(&listener, batch).await {
                crate::log_warn!("[{}] {}: {_e}", decoder.drive_type(), descriptor.name);
            }
        }

        crate::log_debug!("[{}] receive loop stopped for {}", decoder.drive_type(), descriptor.name);
    }
}

#[async_trait::async_trait]
impl Registry for PubSubRegistry {
    // ---
    fn base(&self) -> &RegistryBase {
        &self.base
    }

    async fn init_registry_listeners(&self, all: &[ListenerPtr]) -> Result<()> {
        // ---
        for listener in self.base.bound(all) {
            let channel = self.channel(&listener.descriptor().topic);
            let rx = self.client.subscribe(&channel).await?;
            crate::log_info!("[{}] subscribed {} to {channel}", self.base.name, listener.descriptor().name);

            self.loops.spawn(Self::receive_loop(
                listener,
                rx,
                self.loops.signal(),
                self.prefix.clone(),
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
        let channel = self.channel(envelope.topic());
        let result = |receivers| {
            EventResult::new(
                envelope.event_id.clone(),
                envelope.topic.clone(),
                NativeResult::Accepted { receivers },
            )
        };

        let outcome = match self.serializer.serialize(&envelope) {
            Ok(payload) => self.client.publish(&channel, payload).await.map(result),
            Err(e) => Err(e),
        };
        if let Err(_e) = &outcome {
            crate::log_warn!("[{}] publish to {channel} failed: {_e}", self.base.name);
        }

        report(callback.as_ref(), outcome, || result(0))
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.loops.shutdown().await;
        if let Err(_e) = self.client.close().await {
            crate::log_warn!("[{}] client close failed: {_e}", self.base.name);
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
    use crate::transport::memory::MemoryPubSub;
    use crate::{listener_fn, ListenerDescriptor};
    use std::time::Duration;

    #[tokio::test]
    async fn listener_receives_published_event_once() {
        // ---
        let broker = MemoryPubSub::new();
        let registry = PubSubRegistry::new(
            &PubSubConfig::new("cache", "memory://").default_registry(),
            broker.clone(),
            DefaultSerializer::shared(),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = listener_fn(ListenerDescriptor::new("orders"), move |_, events| {
            let tx = tx.clone();
            async move {
                for e in events {
                    let _ = tx.send(e);
                }
                Ok(())
            }
        });
        registry.init_registry_listeners(&[listener]).await.unwrap();

        let mut env = Envelope::build("orders", "o-1").with_event_id("e-1");
        env.drive_type = Some(registry.base().drive_type().unwrap());
        registry.publish(env).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.event_id(), "e-1");
        assert_eq!(got.topic(), "orders");
        assert_eq!(got.group(), "DEFAULT");
        assert_eq!(broker.published_on("eventbus:orders"), 1);

        registry.close().await.unwrap();
        registry.close().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_topic_falls_back_to_registry_channel() {
        // ---
        let broker = MemoryPubSub::new();
        let registry = PubSubRegistry::new(
            &PubSubConfig::new("cache", "memory://").channel_prefix("bus/"),
            broker.clone(),
            DefaultSerializer::shared(),
        )
        .unwrap();

        assert_eq!(registry.channel(""), "bus/cache");
        registry
            .publish(Envelope::build("", "x").with_event_id("e"))
            .await
            .unwrap();
        assert_eq!(broker.published_on("bus/cache"), 1);
    }
}

// src/transport/ordered.rs

//! Ordered-queue (RocketMQ-style) transport.
//!
//! Publishing sends one message per envelope with the envelope tags and the
//! event id as message key. An empty topic falls back to `producer_topic`.
//!
//! Consumers come in two modes, chosen per listener:
//!
//! - **push**: the client runs a native push consumer per listener. A
//!   listener topic may list several topics (`"a,b"`), each subscribed with
//!   the listener's tag expression. Handler success maps to
//!   [`ConsumeStatus::Success`]; failure maps to
//!   [`ConsumeStatus::SuspendCurrentQueue`] under [`ConsumeMode::Orderly`] and
//!   [`ConsumeStatus::ReconsumeLater`] under [`ConsumeMode::Concurrently`].
//! - **pull**: every queue of every listener topic is polled by the
//!   [`PullScheduler`] with exponential backoff on empty pulls.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::{guard, report, Decoder, Inbound};
use crate::config::{ConsumeMode, MessageModel, OrderedConfig};
use crate::pull::{PullResult, PullScheduler, QueuePuller};
use crate::router::ConsumerRouter;
use crate::serializer::SerializerPtr;
use crate::{
    // ---
    ConsumerMode,
    Envelope,
    EventBusError,
    EventResult,
    ListenerDescriptor,
    ListenerPtr,
    NativeMessage,
    NativeResult,
    OffsetPolicy,
    Registry,
    RegistryBase,
    Result,
    TransportKind,
};

/// Tag expression matching every tag.
pub const ALL_TAGS: &str = "*";

/// Broker acknowledgement of a sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub msg_id: String,
    pub queue_id: i32,
}

/// A message as stored by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedMessage {
    pub msg_id: String,
    pub topic: String,
    pub tags: String,
    pub keys: String,
    pub queue_id: i32,
    pub queue_offset: i64,
    pub reconsume_times: u32,
    pub body: Bytes,
}

/// One queue of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageQueue {
    pub topic: String,
    pub broker: String,
    pub queue_id: i32,
}

impl MessageQueue {
    /// `topic@broker:queue_id`, used in logs and offset snapshots.
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.topic, self.broker, self.queue_id)
    }
}

/// Push consumer verdict for one delivered batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeStatus {
    Success,
    /// Orderly: pause this queue and redeliver the same batch.
    SuspendCurrentQueue,
    /// Concurrently: redeliver the batch later.
    ReconsumeLater,
}

/// Outcome of a pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullStatus {
    Found {
        messages: Vec<OrderedMessage>,
        next_offset: i64,
    },
    NoNewMsg,
    NoMatchedMsg,
    OffsetIllegal,
}

/// Push consumer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PushOptions {
    pub group: String,
    pub consume_mode: ConsumeMode,
    pub message_model: MessageModel,
    pub offset: OffsetPolicy,
    pub consume_timestamp: Option<String>,
    pub consume_timeout: Duration,
    pub max_reconsume_times: u32,
    pub batch_size: usize,
}

/// Receives batches from a native push consumer.
#[async_trait::async_trait]
pub trait PushConsumerHandler: Send + Sync {
    async fn consume(&self, messages: Vec<OrderedMessage>) -> ConsumeStatus;
}

pub type PushConsumerHandlerPtr = Arc<dyn PushConsumerHandler>;

/// Ordered-queue broker client seam.
#[async_trait::async_trait]
pub trait OrderedClient: Send + Sync {
    // ---
    async fn send(&self, topic: &str, tags: &str, keys: &str, body: Bytes) -> Result<SendReceipt>;

    /// Start a push consumer for `(topic, tag expression)` pairs. It runs
    /// until [`shutdown`](Self::shutdown).
    async fn start_push_consumer(
        &self,
        subscriptions: Vec<(String, String)>,
        options: PushOptions,
        handler: PushConsumerHandlerPtr,
    ) -> Result<()>;

    async fn fetch_queues(&self, topic: &str) -> Result<Vec<MessageQueue>>;

    /// Offset a new pull consumer of `group` starts at on `queue`.
    async fn start_offset(&self, group: &str, queue: &MessageQueue, policy: OffsetPolicy) -> Result<i64>;

    async fn pull(&self, queue: &MessageQueue, tags: &str, offset: i64, max: usize) -> Result<PullStatus>;

    async fn shutdown(&self) -> Result<()>;
}

pub type OrderedClientPtr = Arc<dyn OrderedClient>;

fn tag_expression(tags: &str) -> String {
    if tags.trim().is_empty() {
        ALL_TAGS.to_string()
    } else {
        tags.to_string()
    }
}

fn topics_of(descriptor: &ListenerDescriptor) -> Vec<String> {
    // ---
    descriptor
        .topic
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn decode_all(decoder: &Decoder, descriptor: &ListenerDescriptor, messages: Vec<OrderedMessage>) -> Vec<Envelope> {
    // ---
    messages
        .into_iter()
        .filter_map(|msg| {
            let inbound = Inbound::new(msg.body.clone())
                .topic(msg.topic.clone())
                .message_id(msg.msg_id.clone())
                .native(NativeMessage::new(msg));
            decoder.decode(descriptor, inbound)
        })
        .collect()
}

/// Push handler routing one listener's batches.
struct ListenerHandler {
    listener: ListenerPtr,
    consume_mode: ConsumeMode,
    decoder: Decoder,
    router: ConsumerRouter,
}

#[async_trait::async_trait]
impl PushConsumerHandler for ListenerHandler {
    // ---
    async fn consume(&self, messages: Vec<OrderedMessage>) -> ConsumeStatus {
        // ---
        let descriptor = self.listener.descriptor();
        let batch = decode_all(&self.decoder, descriptor, messages);

        match self.router.route_to(&self.listener, batch).await {
            Ok(()) => ConsumeStatus::Success,
            Err(_e) => {
                crate::log_warn!("[{}] {}: {_e}", self.decoder.drive_type(), descriptor.name);
                match self.consume_mode {
                    ConsumeMode::Orderly => ConsumeStatus::SuspendCurrentQueue,
                    ConsumeMode::Concurrently => ConsumeStatus::ReconsumeLater,
                }
            }
        }
    }
}

/// Pull-mode adapter for one queue of one listener.
struct QueueHandle {
    label: String,
    queue: MessageQueue,
    tags: String,
    batch_size: usize,
    client: OrderedClientPtr,
    listener: ListenerPtr,
    decoder: Decoder,
    router: ConsumerRouter,
}

#[async_trait::async_trait]
impl QueuePuller for QueueHandle {
    // ---
    fn label(&self) -> &str {
        &self.label
    }

    async fn pull(&self, offset: i64) -> Result<PullResult> {
        // ---
        let status = self
            .client
            .pull(&self.queue, &self.tags, offset, self.batch_size)
            .await?;

        Ok(match status {
            PullStatus::Found {
                messages,
                next_offset,
            } => PullResult::Found {
                batch: decode_all(&self.decoder, self.listener.descriptor(), messages),
                next_offset,
            },
            PullStatus::NoNewMsg => PullResult::NoNewMsg,
            PullStatus::NoMatchedMsg => PullResult::NoMatchedMsg,
            PullStatus::OffsetIllegal => PullResult::OffsetIllegal,
        })
    }

    async fn deliver(&self, batch: Vec<Envelope>) -> Result<()> {
        self.router.route_to(&self.listener, batch).await
    }
}

/// Ordered-queue registry over an [`OrderedClient`].
pub struct OrderedRegistry {
    base: RegistryBase,
    config: OrderedConfig,
    client: OrderedClientPtr,
    serializer: SerializerPtr,
    decoder: Decoder,
    router: ConsumerRouter,
    scheduler: PullScheduler,
    closed: AtomicBool,
}

impl OrderedRegistry {
    // ---
    pub fn new(config: &OrderedConfig, client: OrderedClientPtr, serializer: SerializerPtr) -> Result<Arc<Self>> {
        // ---
        config.validate()?;
        let base = RegistryBase::new(config.name.as_str(), TransportKind::OrderedQueue, config.is_default);
        let decoder = Decoder::new(serializer.clone(), base.drive_type()?);

        Ok(Arc::new(Self {
            router: ConsumerRouter::new(config.name.as_str(), TransportKind::OrderedQueue),
            scheduler: PullScheduler::new(config.backoff.clone()),
            config: config.clone(),
            base,
            client,
            serializer,
            decoder,
            closed: AtomicBool::new(false),
        }))
    }

    /// Next offset of every pulled queue, keyed by queue label.
    pub fn offsets(&self) -> BTreeMap<String, i64> {
        self.scheduler.offsets()
    }

    fn offset_policy(&self, descriptor: &ListenerDescriptor) -> OffsetPolicy {
        descriptor.offset.unwrap_or(self.config.offset)
    }

    async fn start_push(&self, listener: ListenerPtr) -> Result<()> {
        // ---
        let descriptor = listener.descriptor();
        let tags = tag_expression(&descriptor.tags);
        let subscriptions: Vec<(String, String)> = topics_of(descriptor)
            .into_iter()
            .map(|topic| (topic, tags.clone()))
            .collect();

        let options = PushOptions {
            group: descriptor.group.clone(),
            consume_mode: self.config.consume_mode,
            message_model: self.config.message_model,
            offset: self.offset_policy(descriptor),
            consume_timestamp: self.config.consume_timestamp.clone(),
            consume_timeout: self.config.consume_timeout,
            max_reconsume_times: self.config.max_reconsume_times,
            batch_size: self.config.pull_batch_size,
        };
        crate::log_info!(
            "[{}] push consumer {} group {} on {:?}",
            self.base.name,
            descriptor.name,
            options.group,
            subscriptions
        );

        let handler = Arc::new(ListenerHandler {
            listener: listener.clone(),
            consume_mode: self.config.consume_mode,
            decoder: self.decoder.clone(),
            router: self.router.clone(),
        });
        self.client.start_push_consumer(subscriptions, options, handler).await
    }

    async fn start_pull(&self, listener: ListenerPtr) -> Result<()> {
        // ---
        let descriptor = listener.descriptor();
        let tags = tag_expression(&descriptor.tags);
        let policy = self.offset_policy(descriptor);

        for topic in topics_of(descriptor) {
            for queue in self.client.fetch_queues(&topic).await? {
                let start = self.client.start_offset(&descriptor.group, &queue, policy).await?;
                let label = format!("{}/{}", descriptor.name, queue.label());
                crate::log_info!("[{}] pulling {label} from offset {start}", self.base.name);

                self.scheduler.schedule(
                    Arc::new(QueueHandle {
                        label,
                        queue,
                        tags: tags.clone(),
                        batch_size: self.config.pull_batch_size,
                        client: self.client.clone(),
                        listener: listener.clone(),
                        decoder: self.decoder.clone(),
                        router: self.router.clone(),
                    }),
                    start,
                );
            }
        }
        Ok(())
    }

    async fn send(
        client: OrderedClientPtr,
        topic: String,
        tags: String,
        keys: String,
        body: Bytes,
        timeout: Duration,
        envelope_topic: Option<String>,
    ) -> Result<EventResult> {
        // ---
        let receipt = tokio::time::timeout(timeout, client.send(&topic, &tags, &keys, body))
            .await
            .map_err(|_| EventBusError::Transport(format!("send to {topic} timed out after {timeout:?}")))??;

        Ok(EventResult::new(
            receipt.msg_id.clone(),
            envelope_topic,
            NativeResult::Receipt {
                msg_id: receipt.msg_id,
                queue_id: receipt.queue_id,
            },
        ))
    }
}

#[async_trait::async_trait]
impl Registry for OrderedRegistry {
    // ---
    fn base(&self) -> &RegistryBase {
        &self.base
    }

    async fn init_registry_listeners(&self, all: &[ListenerPtr]) -> Result<()> {
        // ---
        for listener in self.base.bound(all) {
            match listener.descriptor().consumer_mode {
                ConsumerMode::Push => self.start_push(listener).await?,
                ConsumerMode::Pull => self.start_pull(listener).await?,
            }
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
                NativeResult::Receipt {
                    msg_id: String::new(),
                    queue_id: -1,
                },
            )
        };

        if self.config.skip_create_producer {
            let err = EventBusError::DriverInit(format!(
                "registry {} was created without a producer",
                self.base.name
            ));
            return report(callback.as_ref(), Err(err), failed);
        }

        let topic = if envelope.topic().is_empty() {
            self.config.producer_topic.clone()
        } else {
            envelope.topic().to_string()
        };
        let payload = match self.serializer.serialize(&envelope) {
            Ok(payload) => payload,
            Err(e) => return report(callback.as_ref(), Err(e), failed),
        };
        let send = Self::send(
            self.client.clone(),
            topic,
            envelope.tags().to_string(),
            envelope.event_id().to_string(),
            payload,
            self.config.send_timeout,
            envelope.topic.clone(),
        );

        match callback {
            Some(cb) if envelope.enable_async => {
                let failure = failed();
                let _name = self.base.name.clone();
                tokio::spawn(async move {
                    let outcome = send.await;
                    if let Err(_e) = &outcome {
                        crate::log_warn!("[{_name}] async send failed: {_e}");
                    }
                    let _ = report(Some(&cb), outcome, || failure);
                });
                Ok(())
            }
            callback => {
                let outcome = send.await;
                if let Err(_e) = &outcome {
                    crate::log_warn!("[{}] send failed: {_e}", self.base.name);
                }
                report(callback.as_ref(), outcome, failed)
            }
        }
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.scheduler.close().await;
        if let Err(_e) = self.client.shutdown().await {
            crate::log_warn!("[{}] client shutdown failed: {_e}", self.base.name);
        }
        crate::log_info!("[{}] closed", self.base.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::error::BoxError;
    use crate::serializer::DefaultSerializer;
    use crate::transport::memory::MemoryOrdered;
    use crate::{callback_fn, listener_fn};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn config() -> OrderedConfig {
        let mut config = OrderedConfig::new("rocket", "memory://").default_registry();
        config.producer_group_id = "producers".into();
        config.producer_topic = "fallback".into();
        config
    }

    #[tokio::test]
    async fn sync_publish_reports_receipt() {
        // ---
        let broker = MemoryOrdered::new(2);
        let registry = OrderedRegistry::new(&config(), broker.clone(), DefaultSerializer::shared()).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let env = Envelope::build("", "x")
            .with_event_id("k1")
            .with_async(false)
            .with_callback(callback_fn(
                move |r| *s.lock().unwrap() = Some(r),
                |_, e| panic!("unexpected failure: {e}"),
            ));
        registry.publish(env).await.unwrap();

        let result = seen.lock().unwrap().clone().unwrap();
        assert!(matches!(result.native, NativeResult::Receipt { .. }));
        assert_eq!(broker.stored("fallback"), 1);
    }

    #[tokio::test]
    async fn push_consumer_subscribes_every_listed_topic() {
        // ---
        let broker = MemoryOrdered::new(2);
        let registry = OrderedRegistry::new(&config(), broker.clone(), DefaultSerializer::shared()).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = listener_fn(ListenerDescriptor::new("a,b"), move |_, events| {
            let tx = tx.clone();
            async move {
                for e in events {
                    let _ = tx.send(e.topic().to_string());
                }
                Ok(())
            }
        });
        registry.init_registry_listeners(&[listener]).await.unwrap();

        registry.publish(Envelope::build("a", "1").with_async(false)).await.unwrap();
        registry.publish(Envelope::build("b", "2").with_async(false)).await.unwrap();

        let mut got = Vec::new();
        for _ in 0..2 {
            got.push(
                tokio::time::timeout(Duration::from_secs(2), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        got.sort();
        assert_eq!(got, vec!["a".to_string(), "b".to_string()]);
        registry.close().await.unwrap();
    }

    #[tokio::test]
    async fn concurrently_failure_is_redelivered() {
        // ---
        let broker = MemoryOrdered::new(1);
        let registry = OrderedRegistry::new(&config(), broker.clone(), DefaultSerializer::shared()).unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let listener = listener_fn(ListenerDescriptor::new("t"), move |_, _| {
            let a = a.clone();
            async move {
                if a.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err::<(), BoxError>("first try fails".into())
                } else {
                    Ok(())
                }
            }
        });
        registry.init_registry_listeners(&[listener]).await.unwrap();
        registry.publish(Envelope::build("t", "x").with_async(false)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while attempts.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        registry.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pull_listener_tracks_queue_offsets() {
        // ---
        let broker = MemoryOrdered::new(1);
        let registry = OrderedRegistry::new(&config(), broker.clone(), DefaultSerializer::shared()).unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let listener = listener_fn(
            ListenerDescriptor::new("t")
                .with_consumer_mode(ConsumerMode::Pull)
                .with_offset(OffsetPolicy::Earliest),
            move |_, events| {
                let h = h.clone();
                async move {
                    h.fetch_add(events.len(), Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        registry.publish(Envelope::build("t", "1").with_async(false)).await.unwrap();
        registry.publish(Envelope::build("t", "2").with_async(false)).await.unwrap();
        registry.init_registry_listeners(&[listener]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(registry.offsets().values().copied().collect::<Vec<_>>(), vec![2]);

        registry.close().await.unwrap();
    }
}

// src/transport/log.rs

//! Log-queue (Kafka-style) transport.
//!
//! Publishes append one record per envelope, keyed by event id. Each bound
//! listener gets one consumer in its group and one poll task per topic;
//! polled records are routed one at a time. A record that fails in the
//! handler is logged and skipped: offsets move on regardless.
//!
//! An empty topic, on publish or on a listener, falls back to the
//! configured default topic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use super::{guard, report, Decoder, Inbound, LoopSet};
use crate::config::LogConfig;
use crate::router::ConsumerRouter;
use crate::serializer::SerializerPtr;
use crate::{
    // ---
    Envelope,
    EventBusError,
    EventResult,
    ListenerPtr,
    NativeMessage,
    NativeResult,
    OffsetPolicy,
    Registry,
    RegistryBase,
    Result,
    TransportKind,
    DEFAULT_GROUP,
};

/// Where the broker stored a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A polled record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Bytes,
}

/// Log broker client seam.
#[async_trait::async_trait]
pub trait LogClient: Send + Sync {
    // ---
    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<RecordMetadata>;

    /// Join `group` on `topic`. `reset` applies when the group has no
    /// committed offset.
    async fn consumer(&self, group: &str, topic: &str, reset: OffsetPolicy) -> Result<LogConsumerBox>;

    async fn close(&self) -> Result<()>;
}

pub type LogClientPtr = Arc<dyn LogClient>;

/// One group member's view of a topic.
#[async_trait::async_trait]
pub trait LogConsumer: Send {
    // ---
    /// Wait up to `timeout` for records; an empty batch means none arrived.
    async fn poll(&mut self, timeout: Duration, max_records: usize) -> Result<Vec<LogRecord>>;

    async fn close(&mut self) -> Result<()>;
}

pub type LogConsumerBox = Box<dyn LogConsumer>;

/// Log-queue registry over a [`LogClient`].
pub struct LogRegistry {
    base: RegistryBase,
    config: LogConfig,
    client: LogClientPtr,
    serializer: SerializerPtr,
    decoder: Decoder,
    router: ConsumerRouter,
    loops: LoopSet,
    closed: AtomicBool,
}

impl LogRegistry {
    // ---
    pub fn new(config: &LogConfig, client: LogClientPtr, serializer: SerializerPtr) -> Result<Arc<Self>> {
        // ---
        config.validate()?;
        let base = RegistryBase::new(config.name.as_str(), TransportKind::LogQueue, config.is_default);
        let decoder = Decoder::new(serializer.clone(), base.drive_type()?);

        Ok(Arc::new(Self {
            router: ConsumerRouter::new(config.name.as_str(), TransportKind::LogQueue),
            loops: LoopSet::new(config.name.as_str()),
            config: config.clone(),
            base,
            client,
            serializer,
            decoder,
            closed: AtomicBool::new(false),
        }))
    }

    fn topic_or_default<'a>(&'a self, topic: &'a str) -> &'a str {
        if topic.is_empty() {
            &self.config.topic
        } else {
            topic
        }
    }

    /// Broker group for a listener group; `DEFAULT` maps to `group_id`.
    fn consumer_group<'a>(&'a self, group: &'a str) -> &'a str {
        // ---
        if group == DEFAULT_GROUP && !self.config.group_id.is_empty() {
            &self.config.group_id
        } else {
            group
        }
    }

    async fn send(
        client: LogClientPtr,
        topic: String,
        key: String,
        payload: Bytes,
        envelope_topic: Option<String>,
    ) -> Result<EventResult> {
        // ---
        let meta = client.send(&topic, &key, payload).await?;
        Ok(EventResult::new(
            meta.offset.to_string(),
            envelope_topic,
            NativeResult::Record {
                partition: meta.partition,
                offset: meta.offset,
            },
        ))
    }

    async fn poll_loop(
        listener: ListenerPtr,
        mut consumer: LogConsumerBox,
        mut shutdown: watch::Receiver<bool>,
        poll_timeout: Duration,
        max_records: usize,
        decoder: Decoder,
        router: ConsumerRouter,
    ) {
        // ---
        let descriptor = listener.descriptor().clone();

        loop {
            let polled = tokio::select! {
                _ = shutdown.changed() => break,
                polled = consumer.poll(poll_timeout, max_records) => polled,
            };

            let records = match polled {
                Ok(records) => records,
                Err(_e) => {
                    crate::log_warn!("[{}] poll for {} failed: {_e}", decoder.drive_type(), descriptor.name);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(poll_timeout) => continue,
                    }
                }
            };

            for record in records {
                let offset = record.offset;
                let inbound = Inbound::new(record.value.clone())
                    .topic(record.topic.clone())
                    .message_id(offset.to_string())
                    .native(NativeMessage::new(record));

                let Some(envelope) = decoder.decode(&descriptor, inbound) else {
                    continue;
                };
                if let Err(_e) = router.route_to(&listener, vec![envelope]).await {
                    crate::log_warn!(
                        "[{}] {} failed on offset {offset}: {_e}",
                        decoder.drive_type(),
                        descriptor.name
                    );
                }
            }
        }

        if let Err(_e) = consumer.close().await {
            crate::log_warn!("[{}] consumer close failed: {_e}", decoder.drive_type());
        }
        crate::log_debug!("[{}] poll loop stopped for {}", decoder.drive_type(), descriptor.name);
    }
}

#[async_trait::async_trait]
impl Registry for LogRegistry {
    // ---
    fn base(&self) -> &RegistryBase {
        &self.base
    }

    async fn init_registry_listeners(&self, all: &[ListenerPtr]) -> Result<()> {
        // ---
        for listener in self.base.bound(all) {
            let descriptor = listener.descriptor();
            let group = self.consumer_group(&descriptor.group);
            let reset = descriptor.offset.unwrap_or(self.config.auto_offset_reset);

            let topics: Vec<&str> = descriptor
                .topic
                .split(',')
                .map(str::trim)
                .map(|t| self.topic_or_default(t))
                .filter(|t| !t.is_empty())
                .collect();
            if topics.is_empty() {
                return Err(EventBusError::DriverInit(format!(
                    "[{}] listener {} has no topic and no default topic is configured",
                    self.base.name, descriptor.name
                )));
            }

            for topic in topics {
                let consumer = self.client.consumer(group, topic, reset).await?;
                crate::log_info!(
                    "[{}] {} polling {topic} as group {group} (reset {})",
                    self.base.name,
                    descriptor.name,
                    reset.as_str()
                );
                self.loops.spawn(Self::poll_loop(
                    listener.clone(),
                    consumer,
                    self.loops.signal(),
                    self.config.poll_timeout,
                    self.config.max_poll_records,
                    self.decoder.clone(),
                    self.router.clone(),
                ));
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
                NativeResult::Record {
                    partition: -1,
                    offset: -1,
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

        let topic = self.topic_or_default(envelope.topic()).to_string();
        let payload = match self.serializer.serialize(&envelope) {
            Ok(payload) => payload,
            Err(e) => return report(callback.as_ref(), Err(e), failed),
        };
        let send = Self::send(
            self.client.clone(),
            topic,
            envelope.event_id().to_string(),
            payload,
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
    use crate::transport::memory::MemoryLog;
    use crate::{callback_fn, listener_fn, ListenerDescriptor};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn config() -> LogConfig {
        let mut config = LogConfig::new("log", "memory://").default_registry().topic("fallback");
        config.poll_timeout = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn sync_publish_reports_record_offset() {
        // ---
        let broker = MemoryLog::new();
        let registry = LogRegistry::new(&config(), broker.clone(), DefaultSerializer::shared()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let s = seen.clone();
            let env = Envelope::build("orders", "x")
                .with_async(false)
                .with_callback(callback_fn(
                    move |r| s.lock().unwrap().push(r),
                    |_, e| panic!("unexpected failure: {e}"),
                ));
            registry.publish(env).await.unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen[1].message_id.as_deref(), Some("1"));
        assert_eq!(seen[1].native, NativeResult::Record { partition: 0, offset: 1 });
        assert_eq!(broker.records("orders"), 2);
    }

    #[tokio::test]
    async fn empty_topic_uses_default_topic() {
        // ---
        let broker = MemoryLog::new();
        let registry = LogRegistry::new(&config(), broker.clone(), DefaultSerializer::shared()).unwrap();

        registry.publish(Envelope::build("", "x").with_async(false)).await.unwrap();
        assert_eq!(broker.records("fallback"), 1);
    }

    #[tokio::test]
    async fn records_are_routed_one_at_a_time() {
        // ---
        let broker = MemoryLog::new();
        let registry = LogRegistry::new(&config(), broker.clone(), DefaultSerializer::shared()).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = listener_fn(ListenerDescriptor::new("orders"), move |_, events| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(events.len());
                Ok(())
            }
        });
        registry.init_registry_listeners(&[listener]).await.unwrap();

        for i in 0..3 {
            registry
                .publish(Envelope::build("orders", format!("o-{i}")).with_async(false))
                .await
                .unwrap();
        }
        for _ in 0..3 {
            let n = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(n, 1);
        }

        registry.close().await.unwrap();
        registry.close().await.unwrap();
    }

    #[tokio::test]
    async fn consume_only_registry_rejects_publish() {
        // ---
        let broker = MemoryLog::new();
        let registry = LogRegistry::new(
            &config().skip_create_producer(true),
            broker.clone(),
            DefaultSerializer::shared(),
        )
        .unwrap();

        let err = registry.publish(Envelope::build("orders", "x")).await.unwrap_err();
        assert!(matches!(err, EventBusError::DriverInit(_)));
        assert_eq!(broker.records("orders"), 0);
    }
}

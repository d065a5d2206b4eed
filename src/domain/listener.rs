// src/domain/listener.rs

//! Listener registration.
//!
//! A listener is registered explicitly with the manager builder as a
//! [`ListenerDescriptor`] (what to consume, from which registries, how to
//! decode it) plus an [`EventListener`] handler. Registries read only the
//! descriptor; the consumer router calls the handler.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::context::EventContext;
use super::envelope::{EntityType, Envelope, SerializeMode};
use crate::error::BoxError;
use crate::EventBusError;

/// Consumer group used when a listener does not name one.
pub const DEFAULT_GROUP: &str = "DEFAULT";

/// Whether the broker pushes deliveries or the registry pulls them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsumerMode {
    #[default]
    Push,
    Pull,
}

/// Where a consumer starts reading when the broker has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetPolicy {
    Earliest,
    Latest,
    Timestamp,
    /// Keep the broker's committed offset; fail if none exists.
    #[serde(rename = "none")]
    Keep,
}

impl OffsetPolicy {
    // ---
    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            OffsetPolicy::Earliest => "earliest",
            OffsetPolicy::Latest => "latest",
            OffsetPolicy::Timestamp => "timestamp",
            OffsetPolicy::Keep => "none",
        }
    }
}

impl FromStr for OffsetPolicy {
    type Err = EventBusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s.to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetPolicy::Earliest),
            "latest" => Ok(OffsetPolicy::Latest),
            "timestamp" => Ok(OffsetPolicy::Timestamp),
            "none" => Ok(OffsetPolicy::Keep),
            other => Err(EventBusError::DriverInit(format!(
                "invalid offset policy: {other}"
            ))),
        }
    }
}

/// Static description of a listener.
///
/// ```
/// # use mom_eventbus::{ConsumerMode, EntityType, ListenerDescriptor};
/// let descriptor = ListenerDescriptor::new("orders.created")
///     .with_group("billing")
///     .with_entity_type(EntityType::Text)
///     .with_consumer_mode(ConsumerMode::Pull)
///     .with_registry("rocket-main");
///
/// assert_eq!(descriptor.group, "billing");
/// assert!(descriptor.registry_names.contains("rocket-main"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerDescriptor {
    // ---
    /// Display name used in logs.
    pub name: String,
    pub topic: String,
    pub group: String,

    /// Broker tag expression; `""` subscribes to all tags.
    pub tags: String,
    pub entity_type: EntityType,
    pub consumer_mode: ConsumerMode,

    /// Registries this listener binds to; empty means every default registry.
    pub registry_names: BTreeSet<String>,
    pub serialize_mode: SerializeMode,

    // AMQP binding. Empty values fall back to the topic/group/tags mapping.
    pub queue: String,
    pub exchange: String,
    pub exchange_type: String,
    pub routing_key: String,
    pub durable: bool,
    pub auto_delete: bool,

    /// Overrides the registry's configured offset policy.
    pub offset: Option<OffsetPolicy>,
}

impl ListenerDescriptor {
    // ---
    pub fn new(topic: impl Into<String>) -> Self {
        // ---
        let topic = topic.into();
        Self {
            name: topic.clone(),
            topic,
            group: DEFAULT_GROUP.to_string(),
            tags: String::new(),
            entity_type: EntityType::default(),
            consumer_mode: ConsumerMode::default(),
            registry_names: BTreeSet::new(),
            serialize_mode: SerializeMode::default(),
            queue: String::new(),
            exchange: String::new(),
            exchange_type: "direct".to_string(),
            routing_key: String::new(),
            durable: true,
            auto_delete: false,
            offset: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = tags.into();
        self
    }

    pub fn with_entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = entity_type;
        self
    }

    pub fn with_consumer_mode(mut self, mode: ConsumerMode) -> Self {
        self.consumer_mode = mode;
        self
    }

    /// Bind to a named registry. May be called repeatedly.
    pub fn with_registry(mut self, name: impl Into<String>) -> Self {
        self.registry_names.insert(name.into());
        self
    }

    pub fn with_serialize_mode(mut self, mode: SerializeMode) -> Self {
        self.serialize_mode = mode;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>, exchange_type: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self.exchange_type = exchange_type.into();
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_offset(mut self, offset: OffsetPolicy) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Batch handler invoked by the consumer router.
///
/// `events` holds every envelope of one topic from one inbound batch; it is
/// never empty. Returning an error does not stop delivery to other listeners.
#[async_trait::async_trait]
pub trait EventListener: Send + Sync {
    // ---
    fn descriptor(&self) -> &ListenerDescriptor;

    async fn on_batch(&self, ctx: &EventContext, events: Vec<Envelope>) -> Result<(), BoxError>;
}

/// Shared listener pointer.
pub type ListenerPtr = Arc<dyn EventListener>;

/// Closure-backed [`EventListener`].
pub struct FnListener<F> {
    descriptor: ListenerDescriptor,
    func: F,
}

impl<F> fmt::Debug for FnListener<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnListener")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

#[async_trait::async_trait]
impl<F, Fut> EventListener for FnListener<F>
where
    F: Fn(EventContext, Vec<Envelope>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn descriptor(&self) -> &ListenerDescriptor {
        &self.descriptor
    }

    async fn on_batch(&self, ctx: &EventContext, events: Vec<Envelope>) -> Result<(), BoxError> {
        (self.func)(ctx.clone(), events).await
    }
}

/// Wrap an async closure as a listener.
///
/// ```
/// # use mom_eventbus::{listener_fn, ListenerDescriptor};
/// let listener = listener_fn(ListenerDescriptor::new("audit"), |_ctx, events| async move {
///     for event in events {
///         println!("{}", event.event_id());
///     }
///     Ok(())
/// });
/// # let _ = listener;
/// ```
pub fn listener_fn<F, Fut>(descriptor: ListenerDescriptor, func: F) -> ListenerPtr
where
    F: Fn(EventContext, Vec<Envelope>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(FnListener { descriptor, func })
}

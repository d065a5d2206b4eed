//! Transport-agnostic event dispatch.
//!
//! Producers publish an [`Envelope`] to a topic through a
//! [`RegistryManager`]; the manager hands it to one of several
//! interchangeable registries (in-process sync/async dispatch, pub/sub,
//! publisher-confirmed queues, partitioned logs, ordered queues). Inbound
//! broker deliveries are decoded and routed back to the registered
//! [`EventListener`]s, filtered by topic and consumer group, and publish
//! outcomes are reported through an optional [`EventCallback`].
//!
//! ```no_run
//! use mom_eventbus::{listener_fn, Envelope, EventBusConfig, ListenerDescriptor, RegistryManagerBuilder};
//!
//! # async fn example() -> mom_eventbus::Result<()> {
//! let bus = RegistryManagerBuilder::new(EventBusConfig::default())
//!     .listener(listener_fn(ListenerDescriptor::new("orders"), |_ctx, events| async move {
//!         println!("got {} orders", events.len());
//!         Ok(())
//!     }))
//!     .build()
//!     .await?;
//! bus.start().await?;
//! bus.publish("local-async", Envelope::build("orders", "order-1")).await?;
//! bus.close().await;
//! # Ok(())
//! # }
//! ```

// Must come first so the macros are visible to every module below.
#[macro_use]
mod macros;

// Import all sub modules once...
mod config;
mod domain;
mod error;
mod ledger;
mod manager;
mod manager_builder;
mod pull;
mod router;
mod serializer;
mod sync;

pub mod transport;

pub(crate) use macros::{log_debug, log_error, log_info, log_trace, log_warn};

// Re-export main types
pub use manager::RegistryManager;
pub use manager_builder::RegistryManagerBuilder;

pub use config::{
    //
    AmqpConfig,
    ConsumeMode,
    EventBusConfig,
    ExecutorConfig,
    LocalConfig,
    LogConfig,
    MessageModel,
    OrderedConfig,
    PubSubConfig,
    DEFAULT_CHANNEL_PREFIX,
};

pub use error::{BoxError, EventBusError, Result};
pub use ledger::{ConfirmLedger, DEFAULT_DRAIN_TIMEOUT};
pub use pull::{BackoffConfig, PullResult, QueuePuller};
pub use serializer::{DefaultSerializer, Serializer, SerializerPtr};

// --- public re-exports
pub use domain::{
    //
    callback_fn,
    listener_fn,
    random_id,
    CallbackPtr,
    ConsumerMode,
    CorrelationId,
    DriveType,
    Entity,
    EntityType,
    Envelope,
    EventCallback,
    EventContext,
    EventListener,
    EventResult,
    FnCallback,
    FnListener,
    ListenerDescriptor,
    ListenerPtr,
    NativeMessage,
    NativeResult,
    OffsetPolicy,
    Registry,
    RegistryBase,
    RegistryPtr,
    SerializeMode,
    TransportKind,
    DEFAULT_GROUP,
    DRIVE_TYPE_SEPARATOR,
};

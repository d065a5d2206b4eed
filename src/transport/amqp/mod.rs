//! Acked-queue (AMQP 0-9-1 style) transport.
//!
//! The producer channel runs in confirm mode. A synchronous publish blocks
//! until the broker confirms its sequence number; an asynchronous publish is
//! tracked in the [`ConfirmLedger`](crate::ledger::ConfirmLedger) before the
//! wire write and settled by the broker's confirm stream.
//!
//! Each bound listener consumes on its own channel. A delivery is acked only
//! after the handler returns `Ok`; failures are logged and the delivery is
//! left unacked (never requeued by this layer).
//!
//! Adapters:
//! - lapin - `lapin` crate, behind `transport_lapin` (lapin.rs)

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::Result;

mod registry;

#[cfg(feature = "transport_lapin")]
mod lapin;

pub use registry::AmqpRegistry;

#[cfg(feature = "transport_lapin")]
pub use self::lapin::connect as connect_lapin;

#[cfg(not(feature = "transport_lapin"))]
pub async fn connect_lapin(_config: &crate::AmqpConfig) -> Result<AmqpConnectionPtr> {
    Err(crate::EventBusError::DriverInit(
        "transport_lapin feature is not enabled".into(),
    ))
}

/// Exchange, queue and binding a consumer needs declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeBinding {
    pub exchange: String,
    pub exchange_type: String,
    pub queue: String,
    pub routing_key: String,
    pub durable: bool,
    pub auto_delete: bool,
}

/// A message delivered to a consumer channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
}

/// Receives publisher confirms for a channel in confirm mode.
///
/// `multiple` means every outstanding sequence up to and including `seq`.
pub trait ConfirmListener: Send + Sync {
    // ---
    fn handle_ack(&self, seq: u64, multiple: bool);

    fn handle_nack(&self, seq: u64, multiple: bool);
}

pub type ConfirmListenerPtr = Arc<dyn ConfirmListener>;

/// Broker connection seam.
#[async_trait::async_trait]
pub trait AmqpConnection: Send + Sync {
    // ---
    async fn create_channel(&self) -> Result<AmqpChannelPtr>;

    async fn close(&self) -> Result<()>;
}

pub type AmqpConnectionPtr = Arc<dyn AmqpConnection>;

/// Broker channel seam.
///
/// Publisher sequence numbers start at 1 once confirm mode is selected and
/// increase by one per `basic_publish`. Callers serialize
/// `next_publish_seq()` and `basic_publish()` themselves.
#[async_trait::async_trait]
pub trait AmqpChannel: Send + Sync {
    // ---
    /// Put the channel in confirm mode; confirms go to `listener`.
    async fn confirm_select(&self, listener: ConfirmListenerPtr) -> Result<()>;

    /// Sequence number the next `basic_publish` will get.
    fn next_publish_seq(&self) -> u64;

    async fn basic_publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()>;

    /// Declare exchange and queue and bind them.
    async fn declare(&self, binding: &ExchangeBinding) -> Result<()>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<mpsc::Receiver<Delivery>>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

pub type AmqpChannelPtr = Arc<dyn AmqpChannel>;

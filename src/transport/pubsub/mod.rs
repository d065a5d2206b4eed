//! Pub/sub (Redis-style) transport.
//!
//! Publishes go to channel `channel_prefix + topic`; an empty topic falls
//! back to `channel_prefix + registry name`. Each bound listener owns one
//! subscription and one receive loop. Delivery is best-effort with no
//! confirmation beyond the broker's receiver count.
//!
//! Adapters:
//! - redis - `redis` crate, behind `transport_redis` (redis.rs)

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::Result;

mod registry;

#[cfg(feature = "transport_redis")]
mod redis;

pub use registry::PubSubRegistry;

#[cfg(feature = "transport_redis")]
pub use self::redis::connect as connect_redis;

#[cfg(not(feature = "transport_redis"))]
pub async fn connect_redis(_config: &crate::PubSubConfig) -> Result<PubSubClientPtr> {
    Err(crate::EventBusError::DriverInit(
        "transport_redis feature is not enabled".into(),
    ))
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: Bytes,
}

/// Pub/sub client seam.
///
/// Once `subscribe()` returns, messages published to the channel after that
/// point are delivered to the returned receiver until the client closes.
#[async_trait::async_trait]
pub trait PubSubClient: Send + Sync {
    // ---
    /// Publish and return the number of receivers the broker reported.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<u64>;

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<PubSubMessage>>;

    async fn close(&self) -> Result<()>;
}

pub type PubSubClientPtr = Arc<dyn PubSubClient>;

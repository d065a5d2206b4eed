// src/domain/registry.rs

//! Transport registry abstraction.
//!
//! A registry owns one live connection to one transport, binds the listeners
//! addressed to it, and publishes envelopes on behalf of the manager. It
//! deliberately says nothing about brokers, wire formats or client
//! libraries; concrete registries live under `src/transport/`.
//!
//! Every registry is constructed once from a connection config, started
//! once by [`RegistryManager::start`](crate::RegistryManager::start) and
//! closed once at shutdown. `close()` must be safe to call again.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::envelope::Envelope;
use super::listener::{ListenerDescriptor, ListenerPtr};
use crate::{EventBusError, Result};

/// Separator between registry name and transport kind in a drive type.
pub const DRIVE_TYPE_SEPARATOR: char = '#';

/// Transport kinds known to the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    // ---
    /// In-process, always on the publishing task.
    LocalSync,

    /// In-process, on a bounded executor unless the envelope asks for sync.
    LocalAsync,

    /// Pub/sub channels (Redis-style).
    PubSub,

    /// Publisher-confirmed queues (AMQP-style).
    AckedQueue,

    /// Partitioned logs (Kafka-style).
    LogQueue,

    /// Ordered queues with push or pull consumers (RocketMQ-style).
    OrderedQueue,
}

impl TransportKind {
    // ---
    pub const ALL: [TransportKind; 6] = [
        TransportKind::LocalSync,
        TransportKind::LocalAsync,
        TransportKind::PubSub,
        TransportKind::AckedQueue,
        TransportKind::LogQueue,
        TransportKind::OrderedQueue,
    ];

    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            TransportKind::LocalSync => "local-sync",
            TransportKind::LocalAsync => "local-async",
            TransportKind::PubSub => "pubsub",
            TransportKind::AckedQueue => "acked-queue",
            TransportKind::LogQueue => "log-queue",
            TransportKind::OrderedQueue => "ordered-queue",
        }
    }

    /// In-process transports have no consumer groups.
    pub fn is_groupless(&self) -> bool {
        matches!(self, TransportKind::LocalSync | TransportKind::LocalAsync)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = EventBusError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        TransportKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EventBusError::DriverNotFound(s.to_string()))
    }
}

/// `"<registry>#<kind>"` tag stamped on every envelope a registry handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriveType {
    registry: Arc<str>,
    kind: TransportKind,
}

impl DriveType {
    // ---
    /// Fails with `DriverInit` if the registry name contains the separator.
    pub fn try_new(registry: impl Into<Arc<str>>, kind: TransportKind) -> Result<Self> {
        // ---
        let registry = registry.into();
        if registry.contains(DRIVE_TYPE_SEPARATOR) {
            return Err(EventBusError::DriverInit(format!(
                "registry name {registry:?} must not contain '{DRIVE_TYPE_SEPARATOR}'"
            )));
        }
        Ok(Self { registry, kind })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }
}

impl fmt::Display for DriveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.registry, DRIVE_TYPE_SEPARATOR, self.kind)
    }
}

impl FromStr for DriveType {
    type Err = EventBusError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        let (registry, kind) = s
            .split_once(DRIVE_TYPE_SEPARATOR)
            .ok_or_else(|| EventBusError::Deserialization(format!("invalid drive type: {s}")))?;
        DriveType::try_new(registry, kind.parse()?)
    }
}

/// Shared base state for all registry implementations.
///
/// Each concrete registry embeds this as a field named `base` and returns
/// it from [`Registry::base`], so the default trait methods can answer
/// identity and binding questions uniformly.
#[derive(Debug, Clone)]
pub struct RegistryBase {
    /// Registry name, unique within a manager.
    pub name: Arc<str>,
    pub kind: TransportKind,
    /// Whether this registry is the default for its kind.
    pub is_default: bool,
}

impl RegistryBase {
    // ---
    pub fn new(name: impl Into<Arc<str>>, kind: TransportKind, is_default: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            is_default,
        }
    }

    /// Whether `descriptor` addresses this registry.
    ///
    /// Named registries bind listeners that list them; default registries
    /// additionally bind listeners that list none.
    pub fn binds(&self, descriptor: &ListenerDescriptor) -> bool {
        // ---
        if descriptor.registry_names.is_empty() {
            self.is_default
        } else {
            descriptor.registry_names.contains(self.name.as_ref())
        }
    }

    /// Listeners bound to this registry, in registration order.
    pub fn bound(&self, all: &[ListenerPtr]) -> Vec<ListenerPtr> {
        // ---
        all.iter()
            .filter(|l| self.binds(l.descriptor()))
            .cloned()
            .collect()
    }

    pub fn drive_type(&self) -> Result<DriveType> {
        DriveType::try_new(self.name.clone(), self.kind)
    }
}

/// Transport registry.
///
/// Implementations must ensure that:
/// - `init_registry_listeners()` is called once, after construction and
///   before any inbound delivery; it starts every consumer loop.
/// - `publish()` receives envelopes that already carry an event id and
///   drive type, and reports the outcome through the envelope's callback
///   at most once.
/// - `close()` stops and joins every loop the registry started and is
///   idempotent.
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &RegistryBase;

    fn name(&self) -> &str {
        &self.base().name
    }

    fn kind(&self) -> TransportKind {
        self.base().kind
    }

    fn is_default(&self) -> bool {
        self.base().is_default
    }

    /// Bind the listeners addressed to this registry and start consuming.
    async fn init_registry_listeners(&self, all: &[ListenerPtr]) -> Result<()>;

    /// Publish an envelope.
    async fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Stop consumers and release the connection.
    async fn close(&self) -> Result<()>;
}

/// Shared registry pointer.
pub type RegistryPtr = Arc<dyn Registry>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn binding_rule() {
        // ---
        let default = RegistryBase::new("main", TransportKind::PubSub, true);
        let named = RegistryBase::new("side", TransportKind::PubSub, false);

        let unfiltered = ListenerDescriptor::new("t");
        let to_side = ListenerDescriptor::new("t").with_registry("side");

        assert!(default.binds(&unfiltered));
        assert!(!named.binds(&unfiltered));
        assert!(!default.binds(&to_side));
        assert!(named.binds(&to_side));
    }

    #[test]
    fn drive_type_rejects_separator() {
        // ---
        let err = DriveType::try_new("a#b", TransportKind::LocalSync).unwrap_err();
        assert!(matches!(err, EventBusError::DriverInit(_)));

        let dt = DriveType::try_new("main", TransportKind::AckedQueue).unwrap();
        assert_eq!(dt.to_string(), "main#acked-queue");
        assert_eq!("main#acked-queue".parse::<DriveType>().unwrap(), dt);
    }

    #[test]
    fn kind_parses_by_name() {
        // ---
        for kind in TransportKind::ALL {
            assert_eq!(kind.as_str().parse::<TransportKind>().unwrap(), kind);
        }
        assert!(TransportKind::LocalAsync.is_groupless());
        assert!(!TransportKind::LogQueue.is_groupless());
    }
}

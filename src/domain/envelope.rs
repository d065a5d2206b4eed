// src/domain/envelope.rs

//! Event envelope and payload types.
//!
//! An [`Envelope`] is the unit handed from a producer to a registry and from
//! a registry to listeners. It carries the routing fields (topic, group,
//! tags), the [`Entity`] payload and producer-side publish options. Only the
//! routing fields and the entity ever reach the wire; everything else stays
//! in-process.
//!
//! # Examples
//!
//! ```
//! # use mom_eventbus::{Envelope, SerializeMode};
//! let envelope = Envelope::build("orders.created", "order-42")
//!     .with_group("billing")
//!     .with_async(false)
//!     .with_serialize_mode(SerializeMode::Json);
//!
//! assert_eq!(envelope.topic(), "orders.created");
//! assert!(!envelope.enable_async);
//! ```

use std::any::Any;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::callback::EventCallback;
use super::registry::DriveType;
use crate::{EventBusError, Result};

/// How an envelope is encoded on the wire and decoded on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SerializeMode {
    // ---
    /// Whole envelope as a JSON object.
    #[default]
    Default,

    /// Raw entity bytes, interpreted per [`EntityType`]; no envelope.
    Basic,

    /// Entity-only JSON; no envelope.
    Json,

    /// The transport's native message is passed through untouched.
    Msg,
}

impl SerializeMode {
    // ---
    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            SerializeMode::Default => "DEFAULT",
            SerializeMode::Basic => "BASIC",
            SerializeMode::Json => "JSON",
            SerializeMode::Msg => "MSG",
        }
    }
}

impl fmt::Display for SerializeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SerializeMode {
    type Err = EventBusError;

    /// Case-insensitive match on the mode tag.
    fn from_str(s: &str) -> Result<Self> {
        // ---
        match s.to_ascii_uppercase().as_str() {
            "DEFAULT" => Ok(SerializeMode::Default),
            "BASIC" => Ok(SerializeMode::Basic),
            "JSON" => Ok(SerializeMode::Json),
            "MSG" => Ok(SerializeMode::Msg),
            other => Err(EventBusError::DriverInit(format!(
                "invalid serialize mode: {other}"
            ))),
        }
    }
}

/// Declared payload type of a listener, supplied at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    // ---
    /// Any JSON value; decode into a concrete type with [`Entity::decode`].
    #[default]
    Json,

    /// UTF-8 text.
    Text,

    /// Opaque bytes.
    Bytes,
}

/// A transport-native inbound message, carried as-is in [`SerializeMode::Msg`].
#[derive(Clone)]
pub struct NativeMessage(Arc<dyn Any + Send + Sync>);

impl NativeMessage {
    // ---
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        NativeMessage(Arc::new(value))
    }

    /// Borrow the native message as its concrete client type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for NativeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NativeMessage(..)")
    }
}

/// Event payload.
#[derive(Debug, Clone, Default)]
pub enum Entity {
    // ---
    #[default]
    None,
    Json(serde_json::Value),
    Text(String),
    Bytes(Bytes),
    Native(NativeMessage),
}

impl Entity {
    // ---
    /// Encode any serializable value as a JSON entity.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Entity::Json(serde_json::to_value(value)?))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Entity::None)
    }

    pub fn as_text(&self) -> Option<&str> {
        // ---
        match self {
            Entity::Text(text) => Some(text),
            Entity::Json(serde_json::Value::String(text)) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        // ---
        match self {
            Entity::Bytes(bytes) => Some(bytes),
            Entity::Text(text) => Some(text.as_bytes()),
            _ => None,
        }
    }

    pub fn as_native(&self) -> Option<&NativeMessage> {
        // ---
        match self {
            Entity::Native(native) => Some(native),
            _ => None,
        }
    }

    /// Decode the payload into a concrete type.
    ///
    /// JSON entities are converted directly; text and byte entities are
    /// parsed as JSON documents.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        // ---
        match self {
            Entity::Json(value) => Ok(serde_json::from_value(value.clone())?),
            Entity::Text(text) => Ok(serde_json::from_str(text)?),
            Entity::Bytes(bytes) => Ok(serde_json::from_slice(bytes)?),
            Entity::None => Err(EventBusError::Deserialization(
                "event has no entity".into(),
            )),
            Entity::Native(_) => Err(EventBusError::Deserialization(
                "native messages cannot be decoded".into(),
            )),
        }
    }

    /// JSON form of the entity for the DEFAULT and JSON wire modes.
    pub(crate) fn to_json_value(&self) -> Result<serde_json::Value> {
        // ---
        match self {
            Entity::None => Ok(serde_json::Value::Null),
            Entity::Json(value) => Ok(value.clone()),
            Entity::Text(text) => Ok(serde_json::Value::String(text.clone())),
            Entity::Bytes(bytes) => Ok(serde_json::to_value(bytes.as_ref())?),
            Entity::Native(_) => Err(EventBusError::Transport(
                "native messages cannot be republished".into(),
            )),
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        // ---
        match (self, other) {
            (Entity::None, Entity::None) => true,
            (Entity::Json(a), Entity::Json(b)) => a == b,
            (Entity::Text(a), Entity::Text(b)) => a == b,
            (Entity::Bytes(a), Entity::Bytes(b)) => a == b,
            (Entity::Native(a), Entity::Native(b)) => Arc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Entity {
    fn from(value: serde_json::Value) -> Self {
        Entity::Json(value)
    }
}

impl From<String> for Entity {
    fn from(value: String) -> Self {
        Entity::Text(value)
    }
}

impl From<&str> for Entity {
    fn from(value: &str) -> Self {
        Entity::Text(value.to_string())
    }
}

impl From<Bytes> for Entity {
    fn from(value: Bytes) -> Self {
        Entity::Bytes(value)
    }
}

impl From<Vec<u8>> for Entity {
    fn from(value: Vec<u8>) -> Self {
        Entity::Bytes(Bytes::from(value))
    }
}

/// Event envelope.
///
/// `event_id` and `drive_type` are owned by the manager and registries:
/// producers may preset an id, but the drive type is always overwritten on
/// publish. On the receive path the owning registry fills `raw_bytes`,
/// `drive_type`, and any missing `event_id`, `topic` and `group`.
#[derive(Clone, Default)]
pub struct Envelope {
    // ---
    /// Event identifier, doubling as a trace id.
    pub event_id: Option<String>,

    /// Topic the event is published to.
    pub topic: Option<String>,

    /// Consumer group.
    pub group: Option<String>,

    /// Broker tag expression (ordered queues) or routing key (AMQP).
    pub tags: Option<String>,

    /// `"<registry>#<kind>"` of the registry that handled the event.
    pub drive_type: Option<DriveType>,

    /// Wire encoding for this envelope.
    pub serialize_mode: SerializeMode,

    /// Payload.
    pub entity: Entity,

    /// Inbound wire bytes, set on the receive path only.
    pub raw_bytes: Option<Bytes>,

    /// Publish without blocking on transport confirmation.
    pub enable_async: bool,

    /// Outcome callback for this publish.
    pub callback: Option<Arc<dyn EventCallback>>,
}

impl Envelope {
    // ---
    /// Create an envelope for `topic` with asynchronous publishing enabled.
    pub fn build(topic: impl Into<String>, entity: impl Into<Entity>) -> Self {
        // ---
        Self {
            topic: Some(topic.into()),
            entity: entity.into(),
            enable_async: true,
            ..Self::default()
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_async(mut self, enable_async: bool) -> Self {
        self.enable_async = enable_async;
        self
    }

    pub fn with_serialize_mode(mut self, mode: SerializeMode) -> Self {
        self.serialize_mode = mode;
        self
    }

    pub fn with_callback(mut self, callback: impl EventCallback + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    /// Topic, or `""` when absent.
    pub fn topic(&self) -> &str {
        self.topic.as_deref().unwrap_or("")
    }

    /// Event id, or `""` when absent.
    pub fn event_id(&self) -> &str {
        self.event_id.as_deref().unwrap_or("")
    }

    /// Group, or `""` when absent.
    pub fn group(&self) -> &str {
        self.group.as_deref().unwrap_or("")
    }

    /// Tags, or `""` when absent.
    pub fn tags(&self) -> &str {
        self.tags.as_deref().unwrap_or("")
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("Envelope")
            .field("event_id", &self.event_id)
            .field("topic", &self.topic)
            .field("group", &self.group)
            .field("tags", &self.tags)
            .field("drive_type", &self.drive_type)
            .field("serialize_mode", &self.serialize_mode)
            .field("entity", &self.entity)
            .field("enable_async", &self.enable_async)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn build_defaults_to_async() {
        // ---
        let env = Envelope::build("t", "payload");
        assert!(env.enable_async);
        assert_eq!(env.topic(), "t");
        assert_eq!(env.entity, Entity::Text("payload".into()));
        assert!(env.event_id.is_none());
        assert_eq!(env.serialize_mode, SerializeMode::Default);
    }

    #[test]
    fn serialize_mode_parses_case_insensitive() {
        // ---
        assert_eq!("basic".parse::<SerializeMode>().unwrap(), SerializeMode::Basic);
        assert_eq!("Msg".parse::<SerializeMode>().unwrap(), SerializeMode::Msg);
        assert!("xml".parse::<SerializeMode>().is_err());
    }

    #[test]
    fn decode_json_entity() {
        // ---
        #[derive(Deserialize, Serialize, PartialEq, Debug)]
        struct Order {
            id: u32,
        }

        let entity = Entity::json(&Order { id: 7 }).unwrap();
        let order: Order = entity.decode().unwrap();
        assert_eq!(order, Order { id: 7 });

        assert!(Entity::None.decode::<Order>().is_err());
    }

    #[test]
    fn native_entities_compare_by_identity() {
        // ---
        let native = NativeMessage::new(42u32);
        let a = Entity::Native(native.clone());
        let b = Entity::Native(native);
        let c = Entity::Native(NativeMessage::new(42u32));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_native().unwrap().downcast_ref::<u32>(), Some(&42));
    }
}

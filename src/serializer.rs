// src/serializer.rs

//! Envelope codec.
//!
//! The codec is selected per envelope by [`SerializeMode`]:
//!
//! | mode      | publish                                  | receive                                 |
//! |-----------|------------------------------------------|-----------------------------------------|
//! | `DEFAULT` | `{eventId, topic, group, driveType, entity}` | same; non-envelope JSON falls back to `JSON` |
//! | `JSON`    | entity only, as JSON                     | entity only                             |
//! | `BASIC`   | raw text or bytes                        | raw text or bytes per [`EntityType`]    |
//! | `MSG`     | as `DEFAULT`                             | empty envelope; the registry attaches the native message |
//!
//! Registries hold a [`SerializerPtr`] so hosts can plug in their own codec.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Entity, EntityType, Envelope, EventBusError, Result, SerializeMode};

/// Pluggable envelope codec.
pub trait Serializer: Send + Sync {
    // ---
    /// Encode `envelope` using its own serialize mode.
    fn serialize(&self, envelope: &Envelope) -> Result<Bytes>;

    /// Decode an inbound body. The returned envelope carries only what the
    /// wire provided; the receiving registry fills in the rest.
    fn deserialize(&self, body: &[u8], mode: SerializeMode, entity_type: EntityType)
        -> Result<Envelope>;
}

pub type SerializerPtr = Arc<dyn Serializer>;

/// JSON wire envelope used by `DEFAULT` mode.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    drive_type: Option<String>,
    #[serde(default)]
    entity: Value,
}

/// The built-in codec.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSerializer;

impl DefaultSerializer {
    // ---
    pub fn shared() -> SerializerPtr {
        Arc::new(DefaultSerializer)
    }

    fn encode_envelope(envelope: &Envelope) -> Result<Bytes> {
        // ---
        let wire = WireEnvelope {
            event_id: envelope.event_id.clone(),
            topic: envelope.topic.clone(),
            group: envelope.group.clone(),
            drive_type: envelope.drive_type.as_ref().map(|d| d.to_string()),
            entity: envelope.entity.to_json_value()?,
        };
        Ok(Bytes::from(serde_json::to_vec(&wire)?))
    }

    fn encode_basic(entity: &Entity) -> Result<Bytes> {
        // ---
        match entity {
            Entity::None => Ok(Bytes::new()),
            Entity::Text(text) => Ok(Bytes::from(text.clone())),
            Entity::Bytes(bytes) => Ok(bytes.clone()),
            Entity::Json(Value::String(text)) => Ok(Bytes::from(text.clone())),
            Entity::Json(value) => Ok(Bytes::from(value.to_string())),
            Entity::Native(_) => Err(EventBusError::Transport(
                "native messages cannot be republished".into(),
            )),
        }
    }

    fn decode_basic(body: &[u8], entity_type: EntityType) -> Result<Entity> {
        // ---
        match entity_type {
            EntityType::Text => String::from_utf8(body.to_vec())
                .map(Entity::Text)
                .map_err(|e| EventBusError::Deserialization(e.to_string())),
            EntityType::Bytes => Ok(Entity::Bytes(Bytes::copy_from_slice(body))),
            EntityType::Json => Err(EventBusError::Deserialization(
                "BASIC serialize mode supports text and bytes entities only".into(),
            )),
        }
    }

    /// Entity-only JSON; non-JSON bodies are taken raw for text and byte entities.
    fn decode_json(body: &[u8], entity_type: EntityType) -> Result<Entity> {
        // ---
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => entity_from_value(value, entity_type),
            Err(e) => match entity_type {
                EntityType::Json => Err(EventBusError::Deserialization(e.to_string())),
                _ => Self::decode_basic(body, entity_type),
            },
        }
    }
}

impl Serializer for DefaultSerializer {
    // ---
    fn serialize(&self, envelope: &Envelope) -> Result<Bytes> {
        // ---
        match envelope.serialize_mode {
            SerializeMode::Default | SerializeMode::Msg => Self::encode_envelope(envelope),
            SerializeMode::Json => Ok(Bytes::from(serde_json::to_vec(
                &envelope.entity.to_json_value()?,
            )?)),
            SerializeMode::Basic => Self::encode_basic(&envelope.entity),
        }
    }

    fn deserialize(
        &self,
        body: &[u8],
        mode: SerializeMode,
        entity_type: EntityType,
    ) -> Result<Envelope> {
        // ---
        let mut envelope = Envelope {
            serialize_mode: mode,
            ..Envelope::default()
        };

        match mode {
            SerializeMode::Msg => {}
            SerializeMode::Basic => envelope.entity = Self::decode_basic(body, entity_type)?,
            SerializeMode::Json => envelope.entity = Self::decode_json(body, entity_type)?,
            SerializeMode::Default => match serde_json::from_slice::<WireEnvelope>(body) {
                Ok(wire) if wire.event_id.is_some() || !wire.entity.is_null() => {
                    envelope.event_id = wire.event_id;
                    envelope.topic = wire.topic;
                    envelope.group = wire.group;
                    envelope.drive_type = wire.drive_type.and_then(|d| d.parse().ok());
                    envelope.entity = entity_from_value(wire.entity, entity_type)?;
                }
                _ => envelope.entity = Self::decode_json(body, entity_type)?,
            },
        }
        Ok(envelope)
    }
}

/// Interpret a JSON value as an entity of the declared type.
fn entity_from_value(value: Value, entity_type: EntityType) -> Result<Entity> {
    // ---
    if value.is_null() {
        return Ok(Entity::None);
    }
    match (entity_type, value) {
        (EntityType::Json, value) => Ok(Entity::Json(value)),
        (EntityType::Text, Value::String(text)) => Ok(Entity::Text(text)),
        (EntityType::Text, value) => Ok(Entity::Text(value.to_string())),
        (EntityType::Bytes, Value::String(text)) => Ok(Entity::Bytes(Bytes::from(text))),
        (EntityType::Bytes, value @ Value::Array(_)) => {
            let raw: Vec<u8> = serde_json::from_value(value)?;
            Ok(Entity::Bytes(Bytes::from(raw)))
        }
        (EntityType::Bytes, value) => Ok(Entity::Bytes(Bytes::from(value.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{DriveType, TransportKind};
    use serde_json::json;

    fn codec() -> DefaultSerializer {
        DefaultSerializer
    }

    #[test]
    fn default_mode_writes_camel_case_envelope() {
        // ---
        let mut env = Envelope::build("orders", json!({"id": 1}))
            .with_event_id("e1")
            .with_group("billing");
        env.drive_type = Some(DriveType::try_new("main", TransportKind::PubSub).unwrap());

        let body = codec().serialize(&env).unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            value,
            json!({
                "eventId": "e1",
                "topic": "orders",
                "group": "billing",
                "driveType": "main#pubsub",
                "entity": {"id": 1}
            })
        );

        let back = codec()
            .deserialize(&body, SerializeMode::Default, EntityType::Json)
            .unwrap();
        assert_eq!(back.event_id(), "e1");
        assert_eq!(back.group(), "billing");
        assert_eq!(back.drive_type, env.drive_type);
        assert_eq!(back.entity, env.entity);
    }

    #[test]
    fn default_mode_falls_back_to_entity_json() {
        // ---
        let back = codec()
            .deserialize(br#"{"amount": 3}"#, SerializeMode::Default, EntityType::Json)
            .unwrap();
        assert!(back.event_id.is_none());
        assert_eq!(back.entity, Entity::Json(json!({"amount": 3})));

        let text = codec()
            .deserialize(b"plain words", SerializeMode::Default, EntityType::Text)
            .unwrap();
        assert_eq!(text.entity, Entity::Text("plain words".into()));
    }

    #[test]
    fn json_mode_round_trip() {
        // ---
        let env = Envelope::build("t", json!({"k": [1, 2]})).with_serialize_mode(SerializeMode::Json);
        let body = codec().serialize(&env).unwrap();
        assert_eq!(&body[..], br#"{"k":[1,2]}"#);

        let back = codec()
            .deserialize(&body, SerializeMode::Json, EntityType::Json)
            .unwrap();
        assert_eq!(back.entity, env.entity);
    }

    #[test]
    fn basic_mode_round_trip() {
        // ---
        let env = Envelope::build("t", "hello").with_serialize_mode(SerializeMode::Basic);
        let body = codec().serialize(&env).unwrap();
        assert_eq!(&body[..], b"hello");
        let back = codec()
            .deserialize(&body, SerializeMode::Basic, EntityType::Text)
            .unwrap();
        assert_eq!(back.entity, env.entity);

        let env = Envelope::build("t", vec![0u8, 159, 255]).with_serialize_mode(SerializeMode::Basic);
        let body = codec().serialize(&env).unwrap();
        let back = codec()
            .deserialize(&body, SerializeMode::Basic, EntityType::Bytes)
            .unwrap();
        assert_eq!(back.entity, env.entity);
    }

    #[test]
    fn basic_mode_rejects_json_entity_type() {
        // ---
        let err = codec()
            .deserialize(b"{}", SerializeMode::Basic, EntityType::Json)
            .unwrap_err();
        assert!(matches!(err, EventBusError::Deserialization(_)));
    }

    #[test]
    fn msg_mode_leaves_entity_empty() {
        // ---
        let back = codec()
            .deserialize(b"anything", SerializeMode::Msg, EntityType::Json)
            .unwrap();
        assert!(back.entity.is_none());
        assert_eq!(back.serialize_mode, SerializeMode::Msg);
    }
}

// src/transport/inbound.rs

//! Receive-path decoding shared by every broker registry.
//!
//! Turns one native delivery into an [`Envelope`] for a given listener:
//!
//! - an empty body is skipped (`None`), never handed to a handler;
//! - a body that fails to decode yields an envelope with [`Entity::None`]
//!   and the raw payload is logged;
//! - `group` and `event_id` missing from the wire are filled from the
//!   listener and the native message;
//! - a missing `topic` is filled from the listener's topic; the native
//!   topic is used only when it is one of the listener's topics, since an
//!   exchange or a fallback channel is not a topic the router knows;
//! - `raw_bytes` and `drive_type` are always set by the receiving registry.

use bytes::Bytes;

use crate::serializer::SerializerPtr;
use crate::{
    // ---
    random_id,
    DriveType,
    Entity,
    Envelope,
    ListenerDescriptor,
    NativeMessage,
    SerializeMode,
};

/// One native delivery, as seen by the decoder.
#[derive(Debug, Default)]
pub(crate) struct Inbound {
    pub body: Bytes,
    /// Native topic or channel, when the broker reports one.
    pub topic: Option<String>,
    /// Native message id, used when the wire carries no event id.
    pub message_id: Option<String>,
    /// Native message handed through in MSG mode.
    pub native: Option<NativeMessage>,
}

impl Inbound {
    // ---
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn native(mut self, native: NativeMessage) -> Self {
        self.native = Some(native);
        self
    }
}

/// Per-registry decoder.
#[derive(Clone)]
pub(crate) struct Decoder {
    serializer: SerializerPtr,
    drive_type: DriveType,
}

fn fill(slot: &mut Option<String>, value: impl FnOnce() -> Option<String>) {
    // ---
    if slot.as_deref().map_or(true, str::is_empty) {
        if let Some(value) = value().filter(|v| !v.is_empty()) {
            *slot = Some(value);
        }
    }
}

// Native topic when the listener names it, else the listener topic itself
fn listener_topic(listener: &ListenerDescriptor, native: Option<String>) -> String {
    // ---
    native
        .filter(|t| !t.is_empty())
        .filter(|t| listener.topic.split(',').any(|own| own.trim() == t))
        .unwrap_or_else(|| listener.topic.clone())
}

impl Decoder {
    // ---
    pub fn new(serializer: SerializerPtr, drive_type: DriveType) -> Self {
        Self {
            serializer,
            drive_type,
        }
    }

    pub fn drive_type(&self) -> &DriveType {
        &self.drive_type
    }

    /// Decode a delivery for `listener`; `None` means skip it.
    pub fn decode(&self, listener: &ListenerDescriptor, inbound: Inbound) -> Option<Envelope> {
        // ---
        if inbound.body.is_empty() {
            crate::log_warn!(
                "[{}] empty message body skipped, msg_id={:?}",
                self.drive_type,
                inbound.message_id
            );
            return None;
        }

        let mode = listener.serialize_mode;
        let mut envelope = match self
            .serializer
            .deserialize(&inbound.body, mode, listener.entity_type)
        {
            Ok(envelope) => envelope,
            Err(_err) => {
                crate::log_warn!(
                    "[{}] failed to decode message for {} as {:?}: {_err}; payload: {}",
                    self.drive_type,
                    listener.name,
                    listener.entity_type,
                    String::from_utf8_lossy(&inbound.body)
                );
                Envelope {
                    serialize_mode: mode,
                    entity: Entity::None,
                    ..Envelope::default()
                }
            }
        };

        let Inbound {
            body,
            topic,
            message_id,
            native,
        } = inbound;

        if mode == SerializeMode::Msg {
            if let Some(native) = native {
                envelope.entity = Entity::Native(native);
            }
        }

        if envelope.topic.as_deref().map_or(true, str::is_empty) {
            envelope.topic = Some(listener_topic(listener, topic));
        }
        fill(&mut envelope.group, || Some(listener.group.clone()));
        fill(&mut envelope.event_id, || message_id.or_else(|| Some(random_id())));

        envelope.raw_bytes = Some(body);
        envelope.drive_type = Some(self.drive_type.clone());
        envelope.enable_async = false;
        Some(envelope)
    }
}

//! Domain layer public interface.
//!
//! This module defines the event bus abstractions that are independent of
//! any broker, client library or wire format.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod callback;
mod context;
mod envelope;
mod listener;
mod registry;

// --- Envelope and outcome re-exports ---

pub use envelope::{
    //
    Entity,
    EntityType,
    Envelope,
    NativeMessage,
    SerializeMode,
};

pub(crate) use callback::OnceCallback;
pub use callback::{
    //
    callback_fn,
    CallbackPtr,
    EventCallback,
    EventResult,
    FnCallback,
    NativeResult,
};

pub use context::{random_id, CorrelationId, EventContext};

// --- Listener and registry re-exports ---

pub use listener::{
    //
    listener_fn,
    ConsumerMode,
    EventListener,
    FnListener,
    ListenerDescriptor,
    ListenerPtr,
    OffsetPolicy,
    DEFAULT_GROUP,
};

pub use registry::{
    //
    DriveType,
    Registry,
    RegistryBase,
    RegistryPtr,
    TransportKind,
    DRIVE_TYPE_SEPARATOR,
};

use thiserror::Error;

/// Boxed error returned by listener handlers and broker client seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by the event bus.
///
/// Each variant maps to one failure class of the dispatch layer; transport
/// client failures are folded into [`EventBusError::Transport`] with the
/// underlying message preserved.
#[derive(Error, Debug)]
pub enum EventBusError {
    // ---
    /// The selected transport kind is disabled by configuration.
    #[error("event bus driver {0} is disabled")]
    DriverDisabled(String),

    /// No registry is bound to the publish selector.
    #[error("no event bus driver registered for {0}")]
    DriverNotFound(String),

    /// A registry could not be constructed or initialized.
    #[error("event bus driver init error: {0}")]
    DriverInit(String),

    /// `publish` was called without an envelope.
    #[error("published event must not be empty")]
    PublishEventNil,

    /// Asynchronous publish failed at the transport level.
    #[error("event publish error: {source}")]
    Publish {
        #[source]
        source: Box<EventBusError>,
    },

    /// A listener handler returned an error.
    #[error("listener business error: {message}")]
    ListenerBusiness {
        message: String,
        #[source]
        source: BoxError,
    },

    /// The local async executor is saturated.
    #[error("local async executor queue is full")]
    QueueFull,

    /// An inbound payload could not be decoded.
    #[error("deserialization failure: {0}")]
    Deserialization(String),

    /// The broker negatively acknowledged a publish.
    #[error("broker nack message, seq={0}")]
    BrokerNack(u64),

    /// A confirm ledger entry was discarded at shutdown before the broker confirmed it.
    #[error("confirm ledger closed before broker confirmed seq={0}")]
    LedgerClosed(u64),

    /// A sequence number was tracked twice while still outstanding.
    #[error("sequence number {0} is already outstanding")]
    DuplicateSequence(u64),

    /// Broker client or connection failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// JSON encoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The registry or manager has already been closed.
    #[error("event bus component is closed")]
    Closed,
}

impl EventBusError {
    // ---
    /// Wrap a handler failure as a [`EventBusError::ListenerBusiness`].
    pub fn listener_business(source: BoxError) -> Self {
        // ---
        let message = source.to_string();
        EventBusError::ListenerBusiness { message, source }
    }

    /// Wrap an asynchronous publish failure.
    pub fn publish(source: EventBusError) -> Self {
        // ---
        EventBusError::Publish {
            source: Box::new(source),
        }
    }
}

/// Result type alias for event bus operations
pub type Result<T> = std::result::Result<T, EventBusError>;

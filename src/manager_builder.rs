//! Registry manager builder.
//!
//! Turns an [`EventBusConfig`] plus explicitly registered listeners and
//! broker clients into a [`RegistryManager`].

use std::collections::HashMap;

use crate::config::EventBusConfig;
use crate::serializer::{DefaultSerializer, SerializerPtr};
use crate::transport::amqp::{self, AmqpConnectionPtr, AmqpRegistry};
use crate::transport::log::{LogClientPtr, LogRegistry};
use crate::transport::ordered::{OrderedClientPtr, OrderedRegistry};
use crate::transport::pubsub::{self, PubSubClientPtr, PubSubRegistry};
use crate::transport::LocalRegistry;
use crate::{
    // ---
    ListenerPtr,
    RegistryManager,
    RegistryPtr,
    Result,
    TransportKind,
};

/// Builder for creating registry managers.
///
/// One registry is built per configured connection. A registry whose
/// transport kind is disabled is not built. A registry that fails to build
/// (missing required field, no client, connection refused) is logged and
/// skipped; duplicate names and duplicate defaults fail the whole build.
///
/// Pub/sub and AMQP registries without an explicit client connect with the
/// `transport_redis` / `transport_lapin` adapters when those features are
/// enabled. Log-queue and ordered-queue registries always need a client.
///
/// # Examples
///
/// ## In-process only
/// ```no_run
/// use mom_eventbus::{listener_fn, Envelope, EventBusConfig, ListenerDescriptor, RegistryManagerBuilder};
///
/// # async fn example() -> mom_eventbus::Result<()> {
/// let audit = listener_fn(ListenerDescriptor::new("audit"), |_ctx, events| async move {
///     println!("{} events", events.len());
///     Ok(())
/// });
///
/// let bus = RegistryManagerBuilder::new(EventBusConfig::default())
///     .listener(audit)
///     .build()
///     .await?;
/// bus.start().await?;
///
/// bus.publish("local-sync", Envelope::build("audit", "login")).await?;
/// bus.close().await;
/// # Ok(())
/// # }
/// ```
///
/// ## Redis pub/sub
/// ```no_run
/// use mom_eventbus::{Envelope, EventBusConfig, PubSubConfig, RegistryManagerBuilder};
///
/// # async fn example() -> mom_eventbus::Result<()> {
/// let mut config = EventBusConfig::default();
/// config.pubsub.push(PubSubConfig::new("cache", "redis://localhost:6379").default_registry());
///
/// let bus = RegistryManagerBuilder::new(config).build().await?;
/// bus.start().await?;
/// bus.publish("pubsub", Envelope::build("invalidate", "user:42")).await?;
/// # Ok(())
/// # }
/// ```
pub struct RegistryManagerBuilder {
    // ---
    config: EventBusConfig,
    listeners: Vec<ListenerPtr>,
    serializer: Option<SerializerPtr>,

    // Host-supplied registries, added after the configured ones
    registries: Vec<RegistryPtr>,

    // Broker clients keyed by registry name
    pubsub_clients: HashMap<String, PubSubClientPtr>,
    amqp_connections: HashMap<String, AmqpConnectionPtr>,
    log_clients: HashMap<String, LogClientPtr>,
    ordered_clients: HashMap<String, OrderedClientPtr>,
}

impl RegistryManagerBuilder {
    // ---
    pub fn new(config: EventBusConfig) -> Self {
        // ---
        Self {
            config,
            listeners: Vec::new(),
            serializer: None,
            registries: Vec::new(),
            pubsub_clients: HashMap::new(),
            amqp_connections: HashMap::new(),
            log_clients: HashMap::new(),
            ordered_clients: HashMap::new(),
        }
    }

    /// Register a listener. Every registry sees every listener and binds the
    /// ones addressed to it.
    pub fn listener(mut self, listener: ListenerPtr) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn listeners(mut self, listeners: impl IntoIterator<Item = ListenerPtr>) -> Self {
        self.listeners.extend(listeners);
        self
    }

    /// Add a registry built outside the configuration.
    pub fn registry(mut self, registry: RegistryPtr) -> Self {
        self.registries.push(registry);
        self
    }

    /// Override the wire serializer.
    ///
    /// Default: [`DefaultSerializer`].
    pub fn serializer(mut self, serializer: SerializerPtr) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Client for the pub/sub registry `name`.
    pub fn pubsub_client(mut self, name: impl Into<String>, client: PubSubClientPtr) -> Self {
        self.pubsub_clients.insert(name.into(), client);
        self
    }

    /// Connection for the AMQP registry `name`.
    pub fn amqp_connection(mut self, name: impl Into<String>, connection: AmqpConnectionPtr) -> Self {
        self.amqp_connections.insert(name.into(), connection);
        self
    }

    /// Client for the log-queue registry `name`.
    pub fn log_client(mut self, name: impl Into<String>, client: LogClientPtr) -> Self {
        self.log_clients.insert(name.into(), client);
        self
    }

    /// Client for the ordered-queue registry `name`.
    pub fn ordered_client(mut self, name: impl Into<String>, client: OrderedClientPtr) -> Self {
        self.ordered_clients.insert(name.into(), client);
        self
    }

    /// Build every enabled registry and the manager over them.
    ///
    /// # Errors
    ///
    /// `DriverInit` on a duplicate registry name or a second default for
    /// one transport kind.
    pub async fn build(mut self) -> Result<RegistryManager> {
        // ---
        self.config.validate_topology()?;

        let serializer = self.serializer.take().unwrap_or_else(DefaultSerializer::shared);
        let config = &self.config;
        let enabled = |kind: TransportKind| {
            let on = !config.disabled.contains(&kind);
            if !on {
                crate::log_info!("transport {kind} disabled; skipping its registries");
            }
            on
        };
        let mut registries: Vec<RegistryPtr> = Vec::new();

        if let Some(c) = config.local_sync.as_ref().filter(|_| enabled(TransportKind::LocalSync)) {
            keep(&mut registries, &c.name, LocalRegistry::new_sync(c).map(into_ptr));
        }
        if let Some(c) = config.local_async.as_ref().filter(|_| enabled(TransportKind::LocalAsync)) {
            keep(
                &mut registries,
                &c.name,
                LocalRegistry::new_async(c, &config.executor).map(into_ptr),
            );
        }

        if enabled(TransportKind::PubSub) {
            for c in &config.pubsub {
                let built = match self.pubsub_clients.remove(&c.name) {
                    Some(client) => Ok(client),
                    None => pubsub::connect_redis(c).await,
                }
                .and_then(|client| PubSubRegistry::new(c, client, serializer.clone()))
                .map(into_ptr);
                keep(&mut registries, &c.name, built);
            }
        }

        if enabled(TransportKind::AckedQueue) {
            for c in &config.amqp {
                let connection = match self.amqp_connections.remove(&c.name) {
                    Some(connection) => Ok(connection),
                    None => amqp::connect_lapin(c).await,
                };
                let built = match connection {
                    Ok(connection) => AmqpRegistry::new(c, connection, serializer.clone())
                        .await
                        .map(into_ptr),
                    Err(e) => Err(e),
                };
                keep(&mut registries, &c.name, built);
            }
        }

        if enabled(TransportKind::LogQueue) {
            for c in &config.log {
                let built = self
                    .log_clients
                    .remove(&c.name)
                    .ok_or_else(|| missing_client(&c.name))
                    .and_then(|client| LogRegistry::new(c, client, serializer.clone()))
                    .map(into_ptr);
                keep(&mut registries, &c.name, built);
            }
        }

        if enabled(TransportKind::OrderedQueue) {
            for c in &config.ordered {
                let built = self
                    .ordered_clients
                    .remove(&c.name)
                    .ok_or_else(|| missing_client(&c.name))
                    .and_then(|client| OrderedRegistry::new(c, client, serializer.clone()))
                    .map(into_ptr);
                keep(&mut registries, &c.name, built);
            }
        }

        for registry in self.registries {
            if enabled(registry.kind()) {
                registries.push(registry);
            }
        }

        crate::log_info!(
            "built {} registries: {}",
            registries.len(),
            registries.iter().map(|r| r.name()).collect::<Vec<_>>().join(", ")
        );
        RegistryManager::new(registries, self.listeners, self.config.disabled)
    }
}

fn into_ptr<R: crate::Registry + 'static>(registry: std::sync::Arc<R>) -> RegistryPtr {
    registry
}

fn missing_client(name: &str) -> crate::EventBusError {
    crate::EventBusError::DriverInit(format!("registry {name}: no client supplied"))
}

// Per-registry failures skip that registry only
fn keep(registries: &mut Vec<RegistryPtr>, name: &str, built: Result<RegistryPtr>) {
    // ---
    match built {
        Ok(registry) => registries.push(registry),
        Err(_e) => crate::log_error!("registry {name} skipped: {_e}"),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::{LogConfig, PubSubConfig};
    use crate::transport::memory::{MemoryLog, MemoryPubSub};
    use crate::{Envelope, EventBusError};

    #[tokio::test]
    async fn defaults_build_both_local_registries() {
        // ---
        let bus = RegistryManagerBuilder::new(EventBusConfig::default())
            .build()
            .await
            .unwrap();
        assert!(bus.default_registry(TransportKind::LocalSync).is_some());
        assert!(bus.default_registry(TransportKind::LocalAsync).is_some());
    }

    #[tokio::test]
    async fn invalid_registry_is_skipped() {
        // ---
        let mut config = EventBusConfig::default();
        config.log.push(LogConfig::new("kafka", ""));
        config.pubsub.push(PubSubConfig::new("redis", "redis://x").default_registry());

        let bus = RegistryManagerBuilder::new(config)
            .log_client("kafka", MemoryLog::new())
            .pubsub_client("redis", MemoryPubSub::new())
            .build()
            .await
            .unwrap();

        assert!(bus.registry("kafka").is_none());
        assert!(bus.registry("redis").is_some());
        let err = bus
            .publish("log-queue", Envelope::build("t", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::DriverNotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_names_fail_the_build() {
        // ---
        let mut config = EventBusConfig::default();
        config.pubsub.push(PubSubConfig::new("local-sync", "redis://x"));
        let built = RegistryManagerBuilder::new(config).build().await;
        assert!(matches!(built, Err(EventBusError::DriverInit(_))));
    }

    #[tokio::test]
    async fn disabled_kind_is_not_built() {
        // ---
        let mut config = EventBusConfig::default();
        config.disabled.insert(TransportKind::LocalAsync);
        let bus = RegistryManagerBuilder::new(config).build().await.unwrap();
        assert!(bus.registry("local-async").is_none());
        assert!(bus.is_disabled(TransportKind::LocalAsync));
    }
}

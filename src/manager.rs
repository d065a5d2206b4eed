//! Registry manager.
//!
//! Owns every registry built for the process, resolves a selector to one of
//! them on each publish, and drives the start/close lifecycle.
//!
//! A selector is either a registry name (`"orders"`), a transport kind name
//! (`"pubsub"`, resolved to that kind's default registry), or a full drive
//! type (`"orders#pubsub"`).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::sync::read_ignore_poison;
use crate::{
    // ---
    DriveType,
    Envelope,
    EventBusError,
    EventContext,
    ListenerPtr,
    RegistryPtr,
    Result,
    TransportKind,
    DRIVE_TYPE_SEPARATOR,
};

/// Dispatches envelopes to registries and manages their lifecycle.
///
/// Cloning is cheap; clones share the same registries.
pub struct RegistryManager {
    inner: Arc<Inner>,
}

struct Inner {
    registries: RwLock<BTreeMap<String, RegistryPtr>>,
    defaults: RwLock<BTreeMap<TransportKind, String>>,
    disabled: BTreeSet<TransportKind>,
    listeners: Arc<Vec<ListenerPtr>>,

    // Serializes start() callers
    start_lock: tokio::sync::Mutex<()>,
    running: AtomicBool,
    closed: AtomicBool,
}

impl RegistryManager {
    // ---
    /// Create a manager over already-built registries (internal use by
    /// `RegistryManagerBuilder`).
    ///
    /// # Errors
    ///
    /// `DriverInit` on a duplicate registry name or a second default for
    /// one transport kind.
    pub(crate) fn new(
        registries: Vec<RegistryPtr>,
        listeners: Vec<ListenerPtr>,
        disabled: BTreeSet<TransportKind>,
    ) -> Result<Self> {
        // ---
        let mut by_name = BTreeMap::new();
        let mut defaults = BTreeMap::new();

        for registry in registries {
            let name = registry.name().to_string();
            if registry.is_default() {
                if let Some(other) = defaults.insert(registry.kind(), name.clone()) {
                    return Err(EventBusError::DriverInit(format!(
                        "registries {other:?} and {name:?} are both default for {}",
                        registry.kind()
                    )));
                }
            }
            if by_name.insert(name.clone(), registry).is_some() {
                return Err(EventBusError::DriverInit(format!(
                    "duplicate registry name {name:?}"
                )));
            }
        }

        Ok(Self {
            inner: Arc::new(Inner {
                registries: RwLock::new(by_name),
                defaults: RwLock::new(defaults),
                disabled,
                listeners: Arc::new(listeners),
                start_lock: tokio::sync::Mutex::new(()),
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Publish `envelope` on the registry named by `selector`.
    ///
    /// The envelope gets a fresh random event id when it has none.
    ///
    /// # Errors
    ///
    /// - `PublishEventNil` when no envelope is given
    /// - `DriverDisabled` when the selected transport kind is disabled
    /// - `DriverNotFound` when no registry matches the selector
    /// - `Publish` wrapping the cause when an async envelope fails without
    ///   a callback; sync envelopes return the cause unwrapped
    pub async fn publish(&self, selector: &str, envelope: impl Into<Option<Envelope>>) -> Result<()> {
        self.publish_with_context(&EventContext::new(), selector, envelope)
            .await
    }

    /// Publish with an explicit trace context.
    ///
    /// An envelope without an event id takes the context's trace id.
    pub async fn publish_with_context(
        &self,
        ctx: &EventContext,
        selector: &str,
        envelope: impl Into<Option<Envelope>>,
    ) -> Result<()> {
        // ---
        let started = Instant::now();
        let mut envelope = envelope.into().ok_or(EventBusError::PublishEventNil)?;
        let registry = self.resolve(selector)?;

        if envelope.event_id().is_empty() {
            envelope.event_id = Some(ctx.event_id());
        }
        let drive_type = registry.base().drive_type()?;
        let is_async = envelope.enable_async;
        let event_id = envelope.event_id().to_string();

        crate::log_debug!(
            "publish start: event={event_id} topic={} via {drive_type} async={is_async}",
            envelope.topic()
        );
        envelope.drive_type = Some(drive_type);

        let outcome = registry.publish(envelope).await;
        let _elapsed = started.elapsed();

        match outcome {
            Ok(()) => {
                crate::log_debug!("publish done: event={event_id} in {_elapsed:?}");
                Ok(())
            }
            Err(e) => {
                crate::log_warn!("publish failed: event={event_id} in {_elapsed:?}: {e}");
                if is_async {
                    Err(EventBusError::publish(e))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Publish on the default registry of `kind`.
    pub async fn publish_kind(&self, kind: TransportKind, envelope: impl Into<Option<Envelope>>) -> Result<()> {
        self.publish(kind.as_str(), envelope).await
    }

    fn resolve(&self, selector: &str) -> Result<RegistryPtr> {
        // ---
        if let Some((name, kind)) = selector.split_once(DRIVE_TYPE_SEPARATOR) {
            let kind: TransportKind = kind.parse()?;
            self.check_enabled(kind)?;
            return match self.registry(name) {
                Some(registry) if registry.kind() == kind => Ok(registry),
                _ => Err(EventBusError::DriverNotFound(selector.to_string())),
            };
        }

        if let Some(registry) = self.registry(selector) {
            self.check_enabled(registry.kind())?;
            return Ok(registry);
        }

        let kind: TransportKind = selector.parse()?;
        self.check_enabled(kind)?;
        self.default_registry(kind)
            .ok_or_else(|| EventBusError::DriverNotFound(selector.to_string()))
    }

    fn check_enabled(&self, kind: TransportKind) -> Result<()> {
        // ---
        if self.inner.disabled.contains(&kind) {
            return Err(EventBusError::DriverDisabled(kind.to_string()));
        }
        Ok(())
    }

    /// Registry named `name`.
    pub fn registry(&self, name: &str) -> Option<RegistryPtr> {
        read_ignore_poison(&self.inner.registries).get(name).cloned()
    }

    /// Default registry of `kind`.
    pub fn default_registry(&self, kind: TransportKind) -> Option<RegistryPtr> {
        // ---
        let name = read_ignore_poison(&self.inner.defaults).get(&kind).cloned()?;
        self.registry(&name)
    }

    /// Drive types of every registry, sorted by name.
    pub fn drive_types(&self) -> Vec<DriveType> {
        // ---
        read_ignore_poison(&self.inner.registries)
            .values()
            .filter_map(|r| r.base().drive_type().ok())
            .collect()
    }

    pub fn is_disabled(&self, kind: TransportKind) -> bool {
        self.inner.disabled.contains(&kind)
    }

    /// True between a successful `start()` and `close()`.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Bind listeners on every registry and start consuming.
    ///
    /// Registries initialize in parallel; all of them are joined before the
    /// first failure is returned. Calling `start()` again after success is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// `DriverInit` when a registry name contains `#` or a registry task
    /// panics, `Closed` after `close()`, or the first registry's error.
    pub async fn start(&self) -> Result<()> {
        // ---
        let _guard = self.inner.start_lock.lock().await;
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(EventBusError::Closed);
        }
        if self.is_running() {
            return Ok(());
        }

        let registries: Vec<RegistryPtr> = read_ignore_poison(&self.inner.registries)
            .values()
            .cloned()
            .collect();
        for registry in &registries {
            registry.base().drive_type()?;
        }

        let handles: Vec<_> = registries
            .into_iter()
            .map(|registry| {
                let listeners = self.inner.listeners.clone();
                let name = registry.name().to_string();
                let handle = tokio::spawn(async move { registry.init_registry_listeners(&listeners).await });
                (name, handle)
            })
            .collect();

        let mut first_err = None;
        for (name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(EventBusError::DriverInit(format!(
                    "registry {name} init task failed: {e}"
                ))),
            };
            if let Err(e) = outcome {
                crate::log_error!("registry {name} failed to start: {e}");
                first_err.get_or_insert(e);
            }
        }

        if let Some(e) = first_err {
            return Err(e);
        }

        self.inner.running.store(true, Ordering::Release);
        crate::log_info!(
            "event bus started with {} registries and {} listeners",
            read_ignore_poison(&self.inner.registries).len(),
            self.inner.listeners.len()
        );
        Ok(())
    }

    /// Close every registry. Errors are logged; later calls are no-ops.
    pub async fn close(&self) {
        // ---
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = self.inner.start_lock.lock().await;
        self.inner.running.store(false, Ordering::Release);

        let registries: Vec<RegistryPtr> = read_ignore_poison(&self.inner.registries)
            .values()
            .cloned()
            .collect();
        for registry in registries {
            if let Err(_e) = registry.close().await {
                crate::log_error!("registry {} close failed: {_e}", registry.name());
            }
        }
        crate::log_info!("event bus closed");
    }

    /// Same as [`close`](Self::close).
    pub async fn stop(&self) {
        self.close().await
    }
}

impl Clone for RegistryManager {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

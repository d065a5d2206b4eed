// src/transport/local.rs

//! In-process registries.
//!
//! `local-sync` dispatches every publish on the publishing task.
//! `local-async` dispatches on a bounded executor when the envelope asks for
//! asynchronous delivery: at most `max_in_flight` dispatches run at once,
//! and when the executor is saturated the dispatch raises
//! [`EventBusError::QueueFull`] internally and runs on the publishing task
//! instead (caller-runs).
//!
//! Both are groupless: listeners receive every envelope of their topic
//! regardless of group.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Semaphore;

use super::{guard, report};
use crate::config::{ExecutorConfig, LocalConfig};
use crate::router::ConsumerRouter;
use crate::sync::{read_ignore_poison, write_ignore_poison};
use crate::{
    // ---
    Envelope,
    EventBusError,
    EventResult,
    ListenerPtr,
    NativeResult,
    Registry,
    RegistryBase,
    Result,
    TransportKind,
};

struct Executor {
    permits: Arc<Semaphore>,
    capacity: u32,
    await_termination: Duration,
}

/// In-process registry, synchronous or asynchronous.
pub struct LocalRegistry {
    base: RegistryBase,
    router: ConsumerRouter,
    listeners: Arc<RwLock<Vec<ListenerPtr>>>,
    executor: Option<Executor>,
    closed: AtomicBool,
}

impl LocalRegistry {
    // ---
    /// Registry that always dispatches on the publishing task.
    pub fn new_sync(config: &LocalConfig) -> Result<Arc<Self>> {
        // ---
        config.validate()?;
        Ok(Arc::new(Self::build(config, TransportKind::LocalSync, None)))
    }

    /// Registry backed by a bounded executor.
    pub fn new_async(config: &LocalConfig, executor: &ExecutorConfig) -> Result<Arc<Self>> {
        // ---
        config.validate()?;
        let capacity = u32::try_from(executor.max_in_flight.max(1)).unwrap_or(u32::MAX);
        let executor = Executor {
            permits: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            await_termination: executor.await_termination,
        };
        Ok(Arc::new(Self::build(
            config,
            TransportKind::LocalAsync,
            Some(executor),
        )))
    }

    fn build(config: &LocalConfig, kind: TransportKind, executor: Option<Executor>) -> Self {
        // ---
        Self {
            base: RegistryBase::new(config.name.as_str(), kind, config.is_default),
            router: ConsumerRouter::new(config.name.as_str(), kind),
            listeners: Arc::new(RwLock::new(Vec::new())),
            executor,
            closed: AtomicBool::new(false),
        }
    }

    /// Run the listeners, then report to the callback.
    async fn dispatch(
        router: ConsumerRouter,
        listeners: Arc<RwLock<Vec<ListenerPtr>>>,
        envelope: Envelope,
    ) -> Result<()> {
        // ---
        let callback = guard(&envelope);
        let result = EventResult::new(
            envelope.event_id.clone(),
            envelope.topic.clone(),
            NativeResult::Local,
        );

        let listeners = read_ignore_poison(&listeners).clone();
        let outcome = router.route(&listeners, vec![envelope]).await;

        let failed = result.clone();
        report(callback.as_ref(), outcome.map(|()| result), || failed)
    }
}

#[async_trait::async_trait]
impl Registry for LocalRegistry {
    // ---
    fn base(&self) -> &RegistryBase {
        &self.base
    }

    async fn init_registry_listeners(&self, all: &[ListenerPtr]) -> Result<()> {
        // ---
        let bound = self.base.bound(all);
        crate::log_info!(
            "[{}] bound {} in-process listener(s)",
            self.base.name,
            bound.len()
        );
        *write_ignore_poison(&self.listeners) = bound;
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        // ---
        if self.closed.load(Ordering::Acquire) {
            return Err(EventBusError::Closed);
        }

        let router = self.router.clone();
        let listeners = self.listeners.clone();

        let Some(executor) = self.executor.as_ref().filter(|_| envelope.enable_async) else {
            return Self::dispatch(router, listeners, envelope).await;
        };

        match executor.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(async move {
                    let _permit = permit;
                    let _event_id = envelope.event_id.clone();
                    if let Err(_e) = Self::dispatch(router, listeners, envelope).await {
                        crate::log_warn!("async dispatch of event {_event_id:?} failed: {_e}");
                    }
                });
                Ok(())
            }
            Err(_) => {
                crate::log_debug!(
                    "[{}] {}; dispatching on caller",
                    self.base.name,
                    EventBusError::QueueFull
                );
                Self::dispatch(router, listeners, envelope).await
            }
        }
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(executor) = &self.executor {
            // every permit back means every spawned dispatch finished
            let drained = tokio::time::timeout(
                executor.await_termination,
                executor.permits.acquire_many(executor.capacity),
            )
            .await;
            if drained.is_err() {
                crate::log_warn!(
                    "[{}] in-flight dispatches still running after {:?}",
                    self.base.name,
                    executor.await_termination
                );
            }
        }

        crate::log_info!("[{}] closed", self.base.name);
        Ok(())
    }
}

//! Transport registry implementations.
//!
//! One module per transport kind. Broker registries talk to their broker
//! through a small client trait (the "seam") defined next to the registry;
//! the crate ships in-memory implementations of every seam under
//! [`memory`], and feature-gated adapters for real client libraries:
//!
//! - `transport_redis`: [`pubsub::connect_redis`]
//! - `transport_lapin`: [`amqp::connect_lapin`]
//!
//! Log-queue and ordered-queue hosts bring their own client.

pub mod amqp;
pub mod log;
pub mod memory;
pub mod ordered;
pub mod pubsub;

mod inbound;
mod local;

pub(crate) use inbound::{Decoder, Inbound};
pub use local::LocalRegistry;

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::OnceCallback;
use crate::sync::lock_ignore_poison;
use crate::{Envelope, EventResult, Result};

/// Consumer loops of one registry: a shared stop signal plus their handles.
pub(crate) struct LoopSet {
    name: Arc<str>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LoopSet {
    // ---
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        // ---
        let (shutdown, _) = watch::channel(false);
        Self {
            name: name.into(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Stop signal for a new loop; resolves `changed()` once on shutdown.
    pub fn signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        lock_ignore_poison(&self.tasks).push(tokio::spawn(fut));
    }

    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.tasks).len()
    }

    /// Signal every loop and join it.
    pub async fn shutdown(&self) {
        // ---
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *lock_ignore_poison(&self.tasks));
        for task in tasks {
            if let Err(_e) = task.await {
                crate::log_warn!("[{}] consumer loop ended abnormally: {_e}", self.name);
            }
        }
    }
}

impl Drop for LoopSet {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Fresh at-most-once guard for this publish attempt.
pub(crate) fn guard(envelope: &Envelope) -> Option<OnceCallback> {
    envelope.callback.clone().map(OnceCallback::new)
}

/// Deliver a publish outcome.
///
/// With a callback the outcome goes to the callback only and `Ok(())` is
/// returned; without one the error is handed back to the caller.
pub(crate) fn report(
    callback: Option<&OnceCallback>,
    outcome: Result<EventResult>,
    failed: impl FnOnce() -> EventResult,
) -> Result<()> {
    // ---
    match (callback, outcome) {
        (Some(cb), Ok(result)) => {
            cb.success(result);
            Ok(())
        }
        (Some(cb), Err(err)) => {
            cb.failure(failed(), err);
            Ok(())
        }
        (None, Ok(_)) => Ok(()),
        (None, Err(err)) => Err(err),
    }
}

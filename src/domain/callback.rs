// src/domain/callback.rs

//! Publish outcome reporting.
//!
//! Every publish attempt produces at most one [`EventResult`], delivered to
//! the envelope's [`EventCallback`] from whichever task observes the outcome:
//! the publishing task for synchronous sends, the ledger settlement worker
//! for confirmed AMQP publishes, or a spawned task for asynchronous sends.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::EventBusError;

/// Transport-native part of a publish outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeResult {
    // ---
    /// Dispatched in-process.
    Local,

    /// Accepted by a pub/sub broker; `receivers` is the subscriber count it reported.
    Accepted { receivers: u64 },

    /// Broker publisher confirm.
    Confirm { ack: bool },

    /// Appended to a log partition.
    Record { partition: i32, offset: i64 },

    /// Stored by an ordered queue.
    Receipt { msg_id: String, queue_id: i32 },
}

/// Outcome of a single publish attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventResult {
    // ---
    /// Broker message id, or the event id for in-process dispatch.
    pub message_id: Option<String>,
    pub topic: Option<String>,
    pub native: NativeResult,
}

impl EventResult {
    // ---
    pub fn new(
        message_id: impl Into<Option<String>>,
        topic: impl Into<Option<String>>,
        native: NativeResult,
    ) -> Self {
        // ---
        Self {
            message_id: message_id.into(),
            topic: topic.into(),
            native,
        }
    }
}

/// Receives the outcome of a publish.
///
/// Implementations must be cheap and non-blocking; they may run on a broker
/// I/O task or the ledger settlement worker.
pub trait EventCallback: Send + Sync {
    // ---
    fn on_success(&self, result: EventResult);

    fn on_failure(&self, result: EventResult, error: EventBusError);
}

pub type CallbackPtr = Arc<dyn EventCallback>;

/// Closure-backed [`EventCallback`].
pub struct FnCallback<S, F> {
    on_success: S,
    on_failure: F,
}

impl<S, F> EventCallback for FnCallback<S, F>
where
    S: Fn(EventResult) + Send + Sync,
    F: Fn(EventResult, EventBusError) + Send + Sync,
{
    fn on_success(&self, result: EventResult) {
        (self.on_success)(result)
    }

    fn on_failure(&self, result: EventResult, error: EventBusError) {
        (self.on_failure)(result, error)
    }
}

/// Build a callback from a success closure and a failure closure.
///
/// ```
/// # use mom_eventbus::{callback_fn, Envelope};
/// let envelope = Envelope::build("audit", "login").with_callback(callback_fn(
///     |ok| println!("sent {:?}", ok.message_id),
///     |_, err| eprintln!("failed: {err}"),
/// ));
/// # let _ = envelope;
/// ```
pub fn callback_fn<S, F>(on_success: S, on_failure: F) -> FnCallback<S, F>
where
    S: Fn(EventResult) + Send + Sync,
    F: Fn(EventResult, EventBusError) + Send + Sync,
{
    FnCallback {
        on_success,
        on_failure,
    }
}

/// At-most-once guard around a callback.
///
/// Registries wrap the envelope callback in a fresh guard per publish
/// attempt; the first `success`/`failure` wins and later calls are dropped.
#[derive(Clone)]
pub(crate) struct OnceCallback {
    inner: CallbackPtr,
    fired: Arc<AtomicBool>,
}

impl OnceCallback {
    // ---
    pub(crate) fn new(inner: CallbackPtr) -> Self {
        Self {
            inner,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    fn claim(&self) -> bool {
        !self.fired.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn success(&self, result: EventResult) {
        // ---
        if self.claim() {
            self.inner.on_success(result);
        }
    }

    pub(crate) fn failure(&self, result: EventResult, error: EventBusError) {
        // ---
        if self.claim() {
            self.inner.on_failure(result, error);
        }
    }
}

impl fmt::Debug for OnceCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnceCallback")
            .field("fired", &self.fired.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn once_guard_fires_first_outcome_only() {
        // ---
        let successes = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));

        let s = successes.clone();
        let f = failures.clone();
        let cb = OnceCallback::new(Arc::new(callback_fn(
            move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            },
            move |_, _| {
                f.fetch_add(1, Ordering::SeqCst);
            },
        )));

        let result = EventResult::new(Some("1".to_string()), None, NativeResult::Local);
        cb.success(result.clone());
        cb.failure(result.clone(), EventBusError::Closed);
        cb.clone().success(result);

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }
}

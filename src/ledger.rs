// src/ledger.rs

//! Delivery-confirmation ledger.
//!
//! Tracks asynchronous publishes awaiting a broker publisher confirm, keyed
//! by the channel's publish sequence number. Entries are inserted on the
//! publishing task *before* the wire write, so a confirm can never arrive
//! for an entry that is not yet tracked.
//!
//! Confirms arrive on broker I/O tasks. They are never settled inline:
//! [`ConfirmLedger::settle`] only enqueues, and a single settlement worker
//! per channel removes entries and runs callbacks strictly in sequence
//! order. Broker confirms are cumulative, so `settle(n, ..)` covers every
//! outstanding entry with `seq <= n`.
//!
//! On [`close`](ConfirmLedger::close) the worker drains what is already
//! queued (bounded by a timeout); anything still outstanding afterwards is
//! failed with [`EventBusError::LedgerClosed`]. Dropping the ledger without
//! closing it fails outstanding entries the same way, without the drain.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::OnceCallback;
use crate::sync::lock_ignore_poison;
use crate::{CallbackPtr, EventBusError, EventResult, NativeResult, Result};

/// Default bound on draining queued confirms at close.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Pending {
    callback: Option<OnceCallback>,
    topic: Option<String>,
}

enum Settlement {
    UpTo { seq: u64, ack: bool },
    One { seq: u64, ack: bool },
    Fail { seq: u64, error: EventBusError },
    Shutdown,
}

type Entries = Arc<Mutex<BTreeMap<u64, Pending>>>;

/// Outstanding publisher confirms of one channel.
pub struct ConfirmLedger {
    channel: String,
    entries: Entries,
    tx: mpsc::UnboundedSender<Settlement>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConfirmLedger {
    // ---
    /// Create a ledger and spawn its settlement worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(channel: impl Into<String>) -> Arc<Self> {
        // ---
        let channel = channel.into();
        let entries: Entries = Arc::new(Mutex::new(BTreeMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(Self::run_worker(channel.clone(), entries.clone(), rx));

        Arc::new(Self {
            channel,
            entries,
            tx,
            worker: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        })
    }

    /// Record an outstanding publish. Call before writing to the wire.
    pub fn track(&self, seq: u64, callback: Option<CallbackPtr>, topic: Option<String>) -> Result<()> {
        // ---
        if self.closed.load(Ordering::Acquire) {
            return Err(EventBusError::Closed);
        }

        let mut entries = lock_ignore_poison(&self.entries);
        if entries.contains_key(&seq) {
            return Err(EventBusError::DuplicateSequence(seq));
        }
        entries.insert(
            seq,
            Pending {
                callback: callback.map(OnceCallback::new),
                topic,
            },
        );
        Ok(())
    }

    /// Settle every outstanding entry with `seq <= up_to`.
    pub fn settle(&self, up_to: u64, ack: bool) {
        self.enqueue(Settlement::UpTo { seq: up_to, ack });
    }

    /// Settle exactly one entry (a non-cumulative confirm).
    pub fn settle_one(&self, seq: u64, ack: bool) {
        self.enqueue(Settlement::One { seq, ack });
    }

    /// Fail an entry whose wire write did not happen.
    pub fn fail(&self, seq: u64, error: EventBusError) {
        self.enqueue(Settlement::Fail { seq, error });
    }

    pub fn outstanding(&self) -> usize {
        lock_ignore_poison(&self.entries).len()
    }

    fn enqueue(&self, settlement: Settlement) {
        // ---
        if self.tx.send(settlement).is_err() {
            crate::log_debug!("[{}] confirm arrived after ledger shutdown", self.channel);
        }
    }

    /// Drain queued settlements, then fail everything still outstanding.
    ///
    /// Idempotent; later calls return immediately.
    pub async fn close(&self, timeout: Duration) {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let worker = lock_ignore_poison(&self.worker).take();
        if let Some(mut worker) = worker {
            let _ = self.tx.send(Settlement::Shutdown);
            if tokio::time::timeout(timeout, &mut worker).await.is_err() {
                crate::log_warn!(
                    "[{}] confirm ledger drain timed out after {timeout:?}",
                    self.channel
                );
                worker.abort();
            }
        }

        self.fail_remaining();
    }

    fn fail_remaining(&self) {
        // ---
        let remaining = std::mem::take(&mut *lock_ignore_poison(&self.entries));
        if !remaining.is_empty() {
            crate::log_warn!(
                "[{}] failing {} unconfirmed publishes at close",
                self.channel,
                remaining.len()
            );
        }
        for (seq, pending) in remaining {
            Self::complete(seq, pending, Err(EventBusError::LedgerClosed(seq)));
        }
    }

    async fn run_worker(
        channel: String,
        entries: Entries,
        mut rx: mpsc::UnboundedReceiver<Settlement>,
    ) {
        // ---
        crate::log_debug!("[{channel}] confirm ledger worker started");

        while let Some(settlement) = rx.recv().await {
            match settlement {
                Settlement::UpTo { seq, ack } => {
                    let settled = {
                        let mut entries = lock_ignore_poison(&entries);
                        match seq.checked_add(1) {
                            Some(next) => {
                                let rest = entries.split_off(&next);
                                std::mem::replace(&mut *entries, rest)
                            }
                            None => std::mem::take(&mut *entries),
                        }
                    };
                    if settled.is_empty() {
                        crate::log_trace!("[{channel}] confirm up to {seq} matched nothing");
                    }
                    for (seq, pending) in settled {
                        Self::complete(seq, pending, Self::outcome(seq, ack));
                    }
                }
                Settlement::One { seq, ack } => {
                    let pending = lock_ignore_poison(&entries).remove(&seq);
                    match pending {
                        Some(pending) => Self::complete(seq, pending, Self::outcome(seq, ack)),
                        None => crate::log_trace!("[{channel}] confirm for unknown seq {seq}"),
                    }
                }
                Settlement::Fail { seq, error } => {
                    let pending = lock_ignore_poison(&entries).remove(&seq);
                    if let Some(pending) = pending {
                        Self::complete(seq, pending, Err(error));
                    }
                }
                Settlement::Shutdown => break,
            }
        }

        crate::log_debug!("[{channel}] confirm ledger worker stopped");
    }

    fn outcome(seq: u64, ack: bool) -> std::result::Result<(), EventBusError> {
        // ---
        if ack {
            Ok(())
        } else {
            Err(EventBusError::BrokerNack(seq))
        }
    }

    fn complete(seq: u64, pending: Pending, outcome: std::result::Result<(), EventBusError>) {
        // ---
        let ack = outcome.is_ok();
        let result = EventResult::new(
            Some(seq.to_string()),
            pending.topic,
            NativeResult::Confirm { ack },
        );

        match (pending.callback, outcome) {
            (Some(callback), Ok(())) => callback.success(result),
            (Some(callback), Err(err)) => callback.failure(result, err),
            (None, Err(err)) => crate::log_warn!("publish seq={seq} failed: {err}"),
            (None, Ok(())) => {}
        }
    }
}

impl Drop for ConfirmLedger {
    fn drop(&mut self) {
        // ---
        if let Some(worker) = lock_ignore_poison(&self.worker).take() {
            worker.abort();
        }
        // dropped without close(): outstanding entries still get an outcome
        self.fail_remaining();
    }
}

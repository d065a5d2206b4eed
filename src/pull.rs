// src/pull.rs

//! Pull-backoff scheduler.
//!
//! Drives one independent polling task per broker queue for pull-mode
//! consumers. Each task waits its current delay, pulls a batch at its next
//! offset, and adjusts:
//!
//! - `Found`: route the batch, advance the offset, reset the delay to the floor
//! - `NoNewMsg`: `delay = min(delay * factor, ceiling)`
//! - `NoMatchedMsg`, `OffsetIllegal`, or a pull error: log, keep the delay
//!
//! Offsets are `Arc<AtomicI64>` cells written only by their own task and
//! readable at any time through [`PullScheduler::offsets`].
//!
//! [`PullScheduler::close`] signals every task through a watch channel and
//! joins them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::sync::lock_ignore_poison;
use crate::{Envelope, Result};

/// Backoff parameters for empty polls.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first pull and after every non-empty pull.
    pub floor: Duration,

    /// Multiplier applied after each empty pull.
    pub factor: u32,

    /// Upper bound on the delay.
    pub ceiling: Duration,
}

impl Default for BackoffConfig {
    /// - `floor`: 1s
    /// - `factor`: 2
    /// - `ceiling`: 60s
    fn default() -> Self {
        // ---
        Self {
            floor: Duration::from_secs(1),
            factor: 2,
            ceiling: Duration::from_secs(60),
        }
    }
}

/// Per-queue delay state.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    // ---
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.floor;
        Self { config, current }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.config.floor;
    }

    /// Grow the delay after an empty pull.
    pub fn backoff(&mut self) -> Duration {
        // ---
        self.current = self
            .current
            .saturating_mul(self.config.factor)
            .min(self.config.ceiling);
        self.current
    }
}

/// Outcome of one pull.
#[derive(Debug)]
pub enum PullResult {
    // ---
    Found {
        batch: Vec<Envelope>,
        next_offset: i64,
    },
    NoNewMsg,
    NoMatchedMsg,
    OffsetIllegal,
}

/// One pullable broker queue.
#[async_trait::async_trait]
pub trait QueuePuller: Send + Sync {
    // ---
    /// Queue label used in logs and offset snapshots.
    fn label(&self) -> &str;

    /// Pull up to one batch starting at `offset`.
    async fn pull(&self, offset: i64) -> Result<PullResult>;

    /// Hand a found batch to the consumer router.
    async fn deliver(&self, batch: Vec<Envelope>) -> Result<()>;
}

/// Owns the polling tasks of one registry.
pub struct PullScheduler {
    config: BackoffConfig,
    offsets: Mutex<BTreeMap<String, Arc<AtomicI64>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl PullScheduler {
    // ---
    pub fn new(config: BackoffConfig) -> Self {
        // ---
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            offsets: Mutex::new(BTreeMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Start polling `puller` from `start_offset`.
    pub fn schedule(&self, puller: Arc<dyn QueuePuller>, start_offset: i64) {
        // ---
        let offset = Arc::new(AtomicI64::new(start_offset));
        lock_ignore_poison(&self.offsets).insert(puller.label().to_string(), offset.clone());

        let backoff = Backoff::new(self.config.clone());
        let shutdown = self.shutdown.subscribe();
        let task = tokio::spawn(Self::run(puller, offset, backoff, shutdown));
        lock_ignore_poison(&self.tasks).push(task);
    }

    /// Snapshot of every queue's next offset.
    pub fn offsets(&self) -> BTreeMap<String, i64> {
        // ---
        lock_ignore_poison(&self.offsets)
            .iter()
            .map(|(label, offset)| (label.clone(), offset.load(Ordering::Acquire)))
            .collect()
    }

    pub fn active(&self) -> usize {
        lock_ignore_poison(&self.tasks).len()
    }

    /// Stop and join every polling task. Idempotent.
    pub async fn close(&self) {
        // ---
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *lock_ignore_poison(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                crate::log_warn!("pull task ended abnormally: {e}");
            }
        }
    }

    async fn run(
        puller: Arc<dyn QueuePuller>,
        offset: Arc<AtomicI64>,
        mut backoff: Backoff,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // ---
        let label = puller.label().to_string();
        crate::log_info!("pull loop started for {label}");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(backoff.current()) => {}
            }
            if *shutdown.borrow() {
                break;
            }

            let next = offset.load(Ordering::Acquire);
            match puller.pull(next).await {
                Ok(PullResult::Found { batch, next_offset }) => {
                    crate::log_trace!("{label}: {} message(s) at offset {next}", batch.len());
                    if let Err(e) = puller.deliver(batch).await {
                        crate::log_warn!("{label}: batch handling failed: {e}");
                    }
                    offset.store(next_offset, Ordering::Release);
                    backoff.reset();
                }
                Ok(PullResult::NoNewMsg) => {
                    let delay = backoff.backoff();
                    crate::log_trace!("{label}: no new messages, next pull in {delay:?}");
                }
                Ok(PullResult::NoMatchedMsg) => {
                    crate::log_trace!("{label}: no matched messages at offset {next}");
                }
                Ok(PullResult::OffsetIllegal) => {
                    crate::log_debug!("{label}: illegal offset {next}");
                }
                Err(e) => {
                    crate::log_warn!("{label}: pull failed: {e}");
                }
            }
        }

        crate::log_info!("pull loop stopped for {label}");
    }
}

impl Drop for PullScheduler {
    fn drop(&mut self) {
        // ---
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    #[test]
    fn backoff_doubles_to_ceiling() {
        // ---
        let mut b = Backoff::new(BackoffConfig::default());
        assert_eq!(b.current(), Duration::from_secs(1));
        let seen: Vec<u64> = (0..7).map(|_| b.backoff().as_secs()).collect();
        assert_eq!(seen, vec![2, 4, 8, 16, 32, 60, 60]);
        b.reset();
        assert_eq!(b.current(), Duration::from_secs(1));
    }

    struct Scripted {
        script: Mutex<VecDeque<PullResult>>,
        pulls: Mutex<Vec<(Instant, i64)>>,
        delivered: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl QueuePuller for Scripted {
        fn label(&self) -> &str {
            "q0"
        }

        async fn pull(&self, offset: i64) -> Result<PullResult> {
            self.pulls.lock().unwrap().push((Instant::now(), offset));
            Ok(self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(PullResult::NoMatchedMsg))
        }

        async fn deliver(&self, batch: Vec<Envelope>) -> Result<()> {
            *self.delivered.lock().unwrap() += batch.len();
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn found_advances_offset_and_resets_delay() {
        // ---
        let puller = Arc::new(Scripted {
            script: Mutex::new(VecDeque::from(vec![
                PullResult::NoNewMsg,
                PullResult::Found {
                    batch: vec![Envelope::build("t", "a"), Envelope::build("t", "b")],
                    next_offset: 2,
                },
            ])),
            pulls: Mutex::default(),
            delivered: Mutex::default(),
        });

        let scheduler = PullScheduler::new(BackoffConfig::default());
        let start = Instant::now();
        scheduler.schedule(puller.clone(), 0);

        tokio::time::sleep(Duration::from_millis(4500)).await;
        scheduler.close().await;

        let pulls = puller.pulls.lock().unwrap().clone();
        let at: Vec<(u64, i64)> = pulls
            .iter()
            .map(|(t, off)| ((*t - start).as_secs(), *off))
            .collect();
        // 1s floor, 2s after the empty pull, back to 1s after the found batch
        assert_eq!(at, vec![(1, 0), (3, 0), (4, 2)]);
        assert_eq!(*puller.delivered.lock().unwrap(), 2);
        assert_eq!(scheduler.offsets().get("q0"), Some(&2));
        assert_eq!(scheduler.active(), 0);
    }
    #[tokio::test(start_paused = true)]
    async fn empty_pulls_double_the_delay() {
        // ---
        let puller = Arc::new(Scripted {
            script: Mutex::new(VecDeque::from(vec![
                PullResult::NoNewMsg,
                PullResult::NoNewMsg,
                PullResult::NoNewMsg,
            ])),
            pulls: Mutex::default(),
            delivered: Mutex::default(),
        });

        let scheduler = PullScheduler::new(BackoffConfig::default());
        let start = Instant::now();
        scheduler.schedule(puller.clone(), 5);

        tokio::time::sleep(Duration::from_millis(7500)).await;
        scheduler.close().await;

        let pulls = puller.pulls.lock().unwrap().clone();
        let times: Vec<u64> = pulls.iter().map(|(t, _)| (*t - start).as_secs()).collect();
        let gaps: Vec<u64> = std::iter::once(times[0])
            .chain(times.windows(2).map(|w| w[1] - w[0]))
            .collect();
        assert_eq!(gaps, vec![1, 2, 4]);
        assert!(pulls.iter().all(|(_, off)| *off == 5));
        assert_eq!(scheduler.offsets().get("q0"), Some(&5));
    }
}

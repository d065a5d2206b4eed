// src/transport/memory/log.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;

use crate::sync::lock_ignore_poison;
use crate::transport::log::{
    // ---
    LogClient,
    LogConsumer,
    LogConsumerBox,
    LogRecord,
    RecordMetadata,
};
use crate::{EventBusError, OffsetPolicy, Result};

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<LogRecord>>,
    // (group, topic) -> next offset
    committed: HashMap<(String, String), i64>,
}

struct Shared {
    state: Mutex<State>,
    appended: watch::Sender<u64>,
}

/// In-memory log broker with one partition per topic.
///
/// Consumers of the same group share one committed offset, so each record
/// reaches one member of every group. Offsets are committed on poll.
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl MemoryLog {
    // ---
    pub fn new() -> Arc<Self> {
        // ---
        let (appended, _) = watch::channel(0);
        Arc::new(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                appended,
            }),
        })
    }

    /// Records stored on `topic`.
    pub fn records(&self, topic: &str) -> usize {
        lock_ignore_poison(&self.shared.state)
            .topics
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Append a raw record, bypassing any producer.
    pub fn append(&self, topic: &str, key: Option<&str>, value: impl Into<Bytes>) -> RecordMetadata {
        // ---
        let meta = {
            let mut state = lock_ignore_poison(&self.shared.state);
            let log = state.topics.entry(topic.to_string()).or_default();
            let offset = log.len() as i64;
            log.push(LogRecord {
                topic: topic.to_string(),
                partition: 0,
                offset,
                key: key.map(str::to_string),
                value: value.into(),
            });
            RecordMetadata {
                topic: topic.to_string(),
                partition: 0,
                offset,
            }
        };
        self.shared.appended.send_modify(|n| *n += 1);
        meta
    }
}

#[async_trait::async_trait]
impl LogClient for MemoryLog {
    // ---
    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<RecordMetadata> {
        let key = Some(key).filter(|k| !k.is_empty());
        Ok(self.append(topic, key, payload))
    }

    async fn consumer(&self, group: &str, topic: &str, reset: OffsetPolicy) -> Result<LogConsumerBox> {
        // ---
        let mut state = lock_ignore_poison(&self.shared.state);
        let end = state.topics.get(topic).map_or(0, Vec::len) as i64;
        let key = (group.to_string(), topic.to_string());

        if !state.committed.contains_key(&key) {
            let start = match reset {
                OffsetPolicy::Earliest | OffsetPolicy::Timestamp => 0,
                OffsetPolicy::Latest => end,
                OffsetPolicy::Keep => {
                    return Err(EventBusError::Transport(format!(
                        "no committed offset for group {group} on {topic}"
                    )))
                }
            };
            state.committed.insert(key.clone(), start);
        }

        Ok(Box::new(MemoryLogConsumer {
            shared: self.shared.clone(),
            appended: self.shared.appended.subscribe(),
            key,
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryLogConsumer {
    shared: Arc<Shared>,
    appended: watch::Receiver<u64>,
    key: (String, String),
}

impl MemoryLogConsumer {
    fn take(&self, max_records: usize) -> Vec<LogRecord> {
        // ---
        let mut guard = lock_ignore_poison(&self.shared.state);
        let state = &mut *guard;
        let Some(next) = state.committed.get_mut(&self.key) else {
            return Vec::new();
        };
        let log = state.topics.get(&self.key.1).map_or(&[][..], Vec::as_slice);
        let start = usize::try_from(*next).unwrap_or(0).min(log.len());
        let batch: Vec<LogRecord> = log[start..].iter().take(max_records.max(1)).cloned().collect();
        *next += batch.len() as i64;
        batch
    }
}

#[async_trait::async_trait]
impl LogConsumer for MemoryLogConsumer {
    // ---
    async fn poll(&mut self, timeout: Duration, max_records: usize) -> Result<Vec<LogRecord>> {
        // ---
        self.appended.borrow_and_update();
        let batch = self.take(max_records);
        if !batch.is_empty() {
            return Ok(batch);
        }

        if tokio::time::timeout(timeout, self.appended.changed()).await.is_err() {
            return Ok(Vec::new());
        }
        Ok(self.take(max_records))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

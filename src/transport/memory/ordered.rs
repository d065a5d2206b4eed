// src/transport/memory/ordered.rs

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::MessageModel;
use crate::sync::lock_ignore_poison;
use crate::transport::ordered::{
    // ---
    ConsumeStatus,
    MessageQueue,
    OrderedClient,
    OrderedMessage,
    PullStatus,
    PushConsumerHandlerPtr,
    PushOptions,
    SendReceipt,
    ALL_TAGS,
};
use crate::{EventBusError, OffsetPolicy, Result};

const BROKER: &str = "memory";

/// Pause before a failed batch is offered again.
const REDELIVERY_DELAY: Duration = Duration::from_millis(50);

// (consumer group, topic, queue id)
type OffsetKey = (String, String, i32);

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Vec<OrderedMessage>>>,
    committed: HashMap<OffsetKey, i64>,
    claimed: HashSet<OffsetKey>,
    sent: u64,
    consumers: u64,
}

impl State {
    fn queues(&mut self, topic: &str, count: usize) -> &mut Vec<Vec<OrderedMessage>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); count])
    }
}

fn tags_match(expression: &str, tags: &str) -> bool {
    // ---
    let expression = expression.trim();
    expression.is_empty()
        || expression == ALL_TAGS
        || expression.split("||").any(|t| t.trim() == tags)
}

fn initial_offset(policy: OffsetPolicy, end: i64) -> i64 {
    match policy {
        OffsetPolicy::Latest => end,
        OffsetPolicy::Earliest | OffsetPolicy::Timestamp | OffsetPolicy::Keep => 0,
    }
}

struct Shared {
    state: Mutex<State>,
    queue_count: usize,
    appended: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// In-memory ordered-queue broker.
///
/// Every topic has a fixed number of queues. Messages with the same key
/// land on the same queue and keep their send order there. Push consumers
/// of one group (clustering) share committed offsets and never consume the
/// same queue at the same time; broadcasting consumers keep their own.
/// A failed batch is offered again until it succeeds or exceeds
/// `max_reconsume_times`.
pub struct MemoryOrdered {
    shared: Arc<Shared>,
}

impl MemoryOrdered {
    // ---
    pub fn new(queue_count: usize) -> Arc<Self> {
        // ---
        let (appended, _) = watch::channel(0);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                queue_count: queue_count.max(1),
                appended,
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Messages stored on `topic` across all queues.
    pub fn stored(&self, topic: &str) -> usize {
        lock_ignore_poison(&self.shared.state)
            .topics
            .get(topic)
            .map_or(0, |queues| queues.iter().map(Vec::len).sum())
    }
}

struct PushConsumer {
    shared: Arc<Shared>,
    offset_group: String,
    subscriptions: Vec<(String, String)>,
    options: PushOptions,
    handler: PushConsumerHandlerPtr,
}

enum Round {
    Idle,
    Progressed,
    Retry,
}

impl PushConsumer {
    // ---
    async fn run(self) {
        // ---
        let mut shutdown = self.shared.shutdown.subscribe();
        let mut appended = self.shared.appended.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }
            appended.borrow_and_update();

            let mut round = Round::Idle;
            for (topic, tags) in &self.subscriptions {
                for queue_id in 0..self.shared.queue_count as i32 {
                    match self.consume_queue(topic, tags, queue_id).await {
                        Round::Retry => round = Round::Retry,
                        Round::Progressed if matches!(round, Round::Idle) => round = Round::Progressed,
                        _ => {}
                    }
                }
            }

            match round {
                Round::Progressed => continue,
                Round::Retry => tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(REDELIVERY_DELAY) => {}
                },
                Round::Idle => tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = appended.changed() => {}
                },
            }
        }
    }

    /// Claim the queue, take the next batch and settle it.
    async fn consume_queue(&self, topic: &str, tags: &str, queue_id: i32) -> Round {
        // ---
        let key: OffsetKey = (self.offset_group.clone(), topic.to_string(), queue_id);
        let (batch, end) = {
            let mut state = lock_ignore_poison(&self.shared.state);
            if state.claimed.contains(&key) {
                return Round::Idle;
            }
            let queues = state.queues(topic, self.shared.queue_count);
            let Some(queue) = queues.get(queue_id as usize) else {
                return Round::Idle;
            };
            let len = queue.len() as i64;
            let start = *state
                .committed
                .get(&key)
                .unwrap_or(&initial_offset(self.options.offset, len));
            if start >= len {
                state.committed.insert(key, start);
                return Round::Idle;
            }

            let queue = &state.topics[topic][queue_id as usize];
            let Some(pending) = usize::try_from(start).ok().and_then(|s| queue.get(s..)) else {
                crate::log_warn!("memory broker: illegal offset {start} on {topic}:{queue_id}");
                return Round::Idle;
            };
            let scanned: Vec<OrderedMessage> = pending
                .iter()
                .take(self.options.batch_size.max(1))
                .cloned()
                .collect();
            let end = start + scanned.len() as i64;
            let batch: Vec<OrderedMessage> = scanned.into_iter().filter(|m| tags_match(tags, &m.tags)).collect();

            if batch.is_empty() {
                state.committed.insert(key, end);
                return Round::Progressed;
            }
            state.claimed.insert(key.clone());
            (batch, end)
        };

        let status = match tokio::time::timeout(self.options.consume_timeout, self.handler.consume(batch.clone())).await {
            Ok(status) => status,
            Err(_) => ConsumeStatus::ReconsumeLater,
        };

        let mut state = lock_ignore_poison(&self.shared.state);
        state.claimed.remove(&key);
        match status {
            ConsumeStatus::Success => {
                state.committed.insert(key, end);
                Round::Progressed
            }
            ConsumeStatus::SuspendCurrentQueue | ConsumeStatus::ReconsumeLater => {
                let queue = &mut state.queues(topic, self.shared.queue_count)[queue_id as usize];
                let mut exhausted = false;
                for msg in &batch {
                    if let Some(stored) = queue.get_mut(msg.queue_offset as usize) {
                        stored.reconsume_times += 1;
                        exhausted |= stored.reconsume_times > self.options.max_reconsume_times;
                    }
                }
                if exhausted {
                    crate::log_warn!("memory broker: dropping batch on {topic}:{queue_id} after max reconsume times");
                    state.committed.insert(key, end);
                    Round::Progressed
                } else {
                    Round::Retry
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl OrderedClient for MemoryOrdered {
    // ---
    async fn send(&self, topic: &str, tags: &str, keys: &str, body: Bytes) -> Result<SendReceipt> {
        // ---
        let receipt = {
            let mut state = lock_ignore_poison(&self.shared.state);
            state.sent += 1;
            let sent = state.sent;

            let queue_id = if keys.is_empty() {
                (sent % self.shared.queue_count as u64) as usize
            } else {
                let mut hasher = DefaultHasher::new();
                keys.hash(&mut hasher);
                (hasher.finish() % self.shared.queue_count as u64) as usize
            };

            let msg_id = format!("{BROKER}-{sent:016X}");
            let queue = &mut state.queues(topic, self.shared.queue_count)[queue_id];
            queue.push(OrderedMessage {
                msg_id: msg_id.clone(),
                topic: topic.to_string(),
                tags: tags.to_string(),
                keys: keys.to_string(),
                queue_id: queue_id as i32,
                queue_offset: queue.len() as i64,
                reconsume_times: 0,
                body,
            });
            SendReceipt {
                msg_id,
                queue_id: queue_id as i32,
            }
        };
        self.shared.appended.send_modify(|n| *n += 1);
        Ok(receipt)
    }

    async fn start_push_consumer(
        &self,
        subscriptions: Vec<(String, String)>,
        options: PushOptions,
        handler: PushConsumerHandlerPtr,
    ) -> Result<()> {
        // ---
        if *self.shared.shutdown.borrow() {
            return Err(EventBusError::Transport("memory broker is shut down".into()));
        }

        let offset_group = {
            let mut state = lock_ignore_poison(&self.shared.state);
            state.consumers += 1;
            let offset_group = match options.message_model {
                MessageModel::Clustering => options.group.clone(),
                MessageModel::Broadcasting => format!("{}#{}", options.group, state.consumers),
            };

            // start positions are fixed now, not when the task first runs
            for (topic, _) in &subscriptions {
                let ends: Vec<i64> = state
                    .queues(topic, self.shared.queue_count)
                    .iter()
                    .map(|q| q.len() as i64)
                    .collect();
                for (queue_id, end) in ends.into_iter().enumerate() {
                    state
                        .committed
                        .entry((offset_group.clone(), topic.clone(), queue_id as i32))
                        .or_insert_with(|| initial_offset(options.offset, end));
                }
            }
            offset_group
        };

        let consumer = PushConsumer {
            shared: self.shared.clone(),
            offset_group,
            subscriptions,
            options,
            handler,
        };
        lock_ignore_poison(&self.shared.tasks).push(tokio::spawn(consumer.run()));
        Ok(())
    }

    async fn fetch_queues(&self, topic: &str) -> Result<Vec<MessageQueue>> {
        // ---
        lock_ignore_poison(&self.shared.state).queues(topic, self.shared.queue_count);
        Ok((0..self.shared.queue_count as i32)
            .map(|queue_id| MessageQueue {
                topic: topic.to_string(),
                broker: BROKER.to_string(),
                queue_id,
            })
            .collect())
    }

    async fn start_offset(&self, group: &str, queue: &MessageQueue, policy: OffsetPolicy) -> Result<i64> {
        // ---
        let mut state = lock_ignore_poison(&self.shared.state);
        let key: OffsetKey = (group.to_string(), queue.topic.clone(), queue.queue_id);
        if let Some(offset) = state.committed.get(&key) {
            return Ok(*offset);
        }
        if policy == OffsetPolicy::Keep {
            return Err(EventBusError::Transport(format!(
                "no committed offset for group {group} on {}",
                queue.label()
            )));
        }
        let end = state
            .queues(&queue.topic, self.shared.queue_count)
            .get(queue.queue_id as usize)
            .map_or(0, Vec::len) as i64;
        Ok(initial_offset(policy, end))
    }

    async fn pull(&self, queue: &MessageQueue, tags: &str, offset: i64, max: usize) -> Result<PullStatus> {
        // ---
        let mut state = lock_ignore_poison(&self.shared.state);
        let Some(log) = state
            .queues(&queue.topic, self.shared.queue_count)
            .get(queue.queue_id as usize)
        else {
            return Ok(PullStatus::OffsetIllegal);
        };

        let len = log.len() as i64;
        if offset < 0 || offset > len {
            return Ok(PullStatus::OffsetIllegal);
        }
        if offset == len {
            return Ok(PullStatus::NoNewMsg);
        }

        let scanned = &log[offset as usize..];
        let take = scanned.len().min(max.max(1));
        // filtered-out messages still advance the offset
        let messages = scanned[..take]
            .iter()
            .filter(|m| tags_match(tags, &m.tags))
            .cloned()
            .collect();
        Ok(PullStatus::Found {
            messages,
            next_offset: offset + take as i64,
        })
    }

    async fn shutdown(&self) -> Result<()> {
        // ---
        let _ = self.shared.shutdown.send(true);
        let tasks = std::mem::take(&mut *lock_ignore_poison(&self.shared.tasks));
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn same_key_keeps_send_order_on_one_queue() {
        // ---
        let broker = MemoryOrdered::new(4);
        let a = broker.send("t", "", "order-7", Bytes::from_static(b"1")).await.unwrap();
        let b = broker.send("t", "", "order-7", Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(a.queue_id, b.queue_id);

        let queue = MessageQueue {
            topic: "t".into(),
            broker: BROKER.into(),
            queue_id: a.queue_id,
        };
        let PullStatus::Found { messages, next_offset } = broker.pull(&queue, "*", 0, 10).await.unwrap() else {
            panic!("expected messages");
        };
        assert_eq!(next_offset, 2);
        assert_eq!(messages[0].body, Bytes::from_static(b"1"));
        assert_eq!(messages[1].body, Bytes::from_static(b"2"));
        assert_eq!(broker.pull(&queue, "*", 2, 10).await.unwrap(), PullStatus::NoNewMsg);
        assert_eq!(broker.pull(&queue, "*", 9, 10).await.unwrap(), PullStatus::OffsetIllegal);
    }

    #[test]
    fn tag_expressions() {
        assert!(tags_match("*", "a"));
        assert!(tags_match("", "a"));
        assert!(tags_match("a || b", "b"));
        assert!(!tags_match("a||b", "c"));
    }

    struct Accept;

    #[async_trait::async_trait]
    impl crate::transport::ordered::PushConsumerHandler for Accept {
        async fn consume(&self, _messages: Vec<OrderedMessage>) -> ConsumeStatus {
            ConsumeStatus::Success
        }
    }

    #[tokio::test]
    async fn illegal_committed_offset_leaves_queue_idle() {
        // ---
        let broker = MemoryOrdered::new(1);
        broker.send("t", "", "", Bytes::from_static(b"1")).await.unwrap();
        lock_ignore_poison(&broker.shared.state)
            .committed
            .insert(("g".into(), "t".into(), 0), -3);

        let consumer = PushConsumer {
            shared: broker.shared.clone(),
            offset_group: "g".into(),
            subscriptions: vec![("t".into(), ALL_TAGS.into())],
            options: PushOptions {
                group: "g".into(),
                consume_mode: crate::ConsumeMode::Concurrently,
                message_model: MessageModel::Clustering,
                offset: OffsetPolicy::Earliest,
                consume_timestamp: None,
                consume_timeout: Duration::from_secs(1),
                max_reconsume_times: 3,
                batch_size: 8,
            },
            handler: Arc::new(Accept),
        };

        assert!(matches!(consumer.consume_queue("t", ALL_TAGS, 0).await, Round::Idle));
    }
}

// src/transport/memory/amqp.rs

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::sync::lock_ignore_poison;
use crate::transport::amqp::{
    // ---
    AmqpChannel,
    AmqpChannelPtr,
    AmqpConnection,
    ConfirmListenerPtr,
    Delivery,
    ExchangeBinding,
};
use crate::Result;

#[derive(Default)]
struct Queue {
    consumers: Vec<mpsc::Sender<Delivery>>,
    next_consumer: usize,
    backlog: VecDeque<Delivery>,
    unacked: BTreeSet<u64>,
}

impl Queue {
    /// Round-robin over live consumers; parks the delivery when none can take it.
    fn offer(&mut self, delivery: Delivery) {
        // ---
        self.consumers.retain(|tx| !tx.is_closed());
        let n = self.consumers.len();
        for i in 0..n {
            let idx = (self.next_consumer + i) % n;
            if self.consumers[idx].try_send(delivery.clone()).is_ok() {
                self.next_consumer = (idx + 1) % n;
                self.unacked.insert(delivery.delivery_tag);
                return;
            }
        }
        self.backlog.push_back(delivery);
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, String>,
    bindings: Vec<(String, String, String)>,
    queues: HashMap<String, Queue>,
    next_delivery_tag: u64,
    published: HashMap<String, usize>,
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    // ---
    fn walk(p: &[&str], k: &[&str]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(&"#"), _) => walk(&p[1..], k) || (!k.is_empty() && walk(p, &k[1..])),
            (Some(&"*"), Some(_)) => walk(&p[1..], &k[1..]),
            (Some(a), Some(b)) if a == b => walk(&p[1..], &k[1..]),
            _ => false,
        }
    }
    let p: Vec<&str> = pattern.split('.').collect();
    let k: Vec<&str> = key.split('.').collect();
    walk(&p, &k)
}

impl State {
    // ---
    fn route(&mut self, exchange: &str, routing_key: &str, body: Bytes) {
        // ---
        *self.published.entry(exchange.to_string()).or_default() += 1;

        let kind = self.exchanges.get(exchange).map(String::as_str).unwrap_or("direct");
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            self.bindings
                .iter()
                .filter(|(ex, key, _)| {
                    ex == exchange
                        && match kind {
                            "fanout" => true,
                            "topic" => topic_matches(key, routing_key),
                            _ => key == routing_key,
                        }
                })
                .map(|(_, _, queue)| queue.clone())
                .collect()
        };

        for name in targets {
            let Some(queue) = self.queues.get_mut(&name) else {
                continue;
            };
            self.next_delivery_tag += 1;
            queue.offer(Delivery {
                delivery_tag: self.next_delivery_tag,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.clone(),
            });
        }
    }
}

struct Shared {
    state: Mutex<State>,
    manual: bool,
    confirm_listener: Mutex<Option<ConfirmListenerPtr>>,
}

/// In-memory AMQP broker.
///
/// Implements direct, fanout and topic exchanges plus the default
/// (nameless) exchange. A queue with several consumers hands each delivery
/// to one of them in turn; deliveries stay unacked until `basic_ack`.
///
/// Publisher confirms are positive and immediate unless the broker was
/// created with [`MemoryAmqp::manual_confirms`], in which case tests settle
/// them through [`MemoryAmqp::confirm`].
pub struct MemoryAmqp {
    shared: Arc<Shared>,
}

impl MemoryAmqp {
    // ---
    pub fn new() -> Arc<Self> {
        Self::create(false)
    }

    /// Broker whose confirms are only sent through [`confirm`](Self::confirm).
    pub fn manual_confirms() -> Arc<Self> {
        Self::create(true)
    }

    fn create(manual: bool) -> Arc<Self> {
        // ---
        Arc::new(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                manual,
                confirm_listener: Mutex::new(None),
            }),
        })
    }

    /// Send a confirm to the most recent channel put in confirm mode.
    pub fn confirm(&self, seq: u64, ack: bool, multiple: bool) {
        // ---
        let listener = lock_ignore_poison(&self.shared.confirm_listener).clone();
        if let Some(listener) = listener {
            if ack {
                listener.handle_ack(seq, multiple);
            } else {
                listener.handle_nack(seq, multiple);
            }
        }
    }

    /// Publishes seen on `exchange`, routed or not.
    pub fn published(&self, exchange: &str) -> usize {
        lock_ignore_poison(&self.shared.state)
            .published
            .get(exchange)
            .copied()
            .unwrap_or(0)
    }

    /// Deliveries handed to consumers of `queue` and not acked yet.
    pub fn unacked(&self, queue: &str) -> usize {
        lock_ignore_poison(&self.shared.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }
}

#[async_trait::async_trait]
impl AmqpConnection for MemoryAmqp {
    // ---
    async fn create_channel(&self) -> Result<AmqpChannelPtr> {
        // ---
        Ok(Arc::new(MemoryAmqpChannel {
            broker: self.shared.clone(),
            next_seq: AtomicU64::new(1),
            confirms: Mutex::new(None),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryAmqpChannel {
    broker: Arc<Shared>,
    next_seq: AtomicU64,
    confirms: Mutex<Option<ConfirmListenerPtr>>,
}

#[async_trait::async_trait]
impl AmqpChannel for MemoryAmqpChannel {
    // ---
    async fn confirm_select(&self, listener: ConfirmListenerPtr) -> Result<()> {
        // ---
        *lock_ignore_poison(&self.confirms) = Some(listener.clone());
        *lock_ignore_poison(&self.broker.confirm_listener) = Some(listener);
        Ok(())
    }

    fn next_publish_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Acquire)
    }

    async fn basic_publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()> {
        // ---
        lock_ignore_poison(&self.broker.state).route(exchange, routing_key, payload);
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);

        if !self.broker.manual {
            let listener = lock_ignore_poison(&self.confirms).clone();
            if let Some(listener) = listener {
                listener.handle_ack(seq, false);
            }
        }
        Ok(())
    }

    async fn declare(&self, binding: &ExchangeBinding) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.broker.state);
        state
            .exchanges
            .entry(binding.exchange.clone())
            .or_insert_with(|| binding.exchange_type.clone());
        state.queues.entry(binding.queue.clone()).or_default();

        let edge = (
            binding.exchange.clone(),
            binding.routing_key.clone(),
            binding.queue.clone(),
        );
        if !state.bindings.contains(&edge) {
            state.bindings.push(edge);
        }
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, _consumer_tag: &str) -> Result<mpsc::Receiver<Delivery>> {
        // ---
        let (tx, rx) = mpsc::channel(256);
        let mut state = lock_ignore_poison(&self.broker.state);
        let q = state.queues.entry(queue.to_string()).or_default();
        q.consumers.push(tx);

        let parked = std::mem::take(&mut q.backlog);
        for delivery in parked {
            q.offer(delivery);
        }
        Ok(rx)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        // ---
        let mut state = lock_ignore_poison(&self.broker.state);
        for queue in state.queues.values_mut() {
            if queue.unacked.remove(&delivery_tag) {
                break;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        lock_ignore_poison(&self.confirms).take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("orders.*", "orders.eu"));
        assert!(topic_matches("orders.#", "orders.eu.paid"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("orders.*", "orders.eu.paid"));
        assert!(!topic_matches("orders.eu", "orders.us"));
    }
}

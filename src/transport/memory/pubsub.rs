// src/transport/memory/pubsub.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

use crate::transport::pubsub::{PubSubClient, PubSubMessage};
use crate::{EventBusError, Result};

/// In-memory pub/sub broker.
///
/// - Once `subscribe()` returns, later publishes on that channel are
///   delivered to the returned receiver.
/// - Every subscriber of a channel gets every message (fan-out).
/// - Channel names match exactly; no pattern subscriptions.
pub struct MemoryPubSub {
    // ---
    subscriptions: RwLock<HashMap<String, Vec<mpsc::Sender<PubSubMessage>>>>,
    published: std::sync::Mutex<HashMap<String, usize>>,
    closed: AtomicBool,
}

impl MemoryPubSub {
    // ---
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self {
            subscriptions: RwLock::new(HashMap::new()),
            published: std::sync::Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Number of publishes seen on `channel`.
    pub fn published_on(&self, channel: &str) -> usize {
        crate::sync::lock_ignore_poison(&self.published)
            .get(channel)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl PubSubClient for MemoryPubSub {
    // ---
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<u64> {
        // ---
        if self.closed.load(Ordering::Acquire) {
            return Err(EventBusError::Transport("memory pubsub is closed".into()));
        }
        *crate::sync::lock_ignore_poison(&self.published)
            .entry(channel.to_string())
            .or_default() += 1;

        let subs = self.subscriptions.read().await;
        let mut receivers = 0;
        for sender in subs.get(channel).into_iter().flatten() {
            // a closed receiver is a dropped subscription
            let message = PubSubMessage {
                channel: channel.to_string(),
                payload: payload.clone(),
            };
            if sender.send(message).await.is_ok() {
                receivers += 1;
            }
        }
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<PubSubMessage>> {
        // ---
        let (tx, rx) = mpsc::channel(256);
        self.subscriptions
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.closed.store(true, Ordering::Release);
        self.subscriptions.write().await.clear();
        Ok(())
    }
}

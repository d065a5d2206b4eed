//! Redis Pub/Sub client using `redis`.
//!
//! This module implements [`PubSubClient`] on top of a Redis Pub/Sub
//! connection pair, using an **actor-based concurrency model**.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns both Redis connections.
//! - The actor is responsible for:
//!   - publishing outbound payloads via `publish_conn`,
//!   - registering channel subscriptions via `pubsub_sink`,
//!   - polling `pubsub_stream` for incoming messages,
//!   - clean shutdown of both connections.
//! - All interaction with the Redis client is serialized through this actor;
//!   no other task ever touches the connections directly.
//!
//! ## Two connections required
//!
//! A connection in Pub/Sub mode cannot issue regular commands like
//! `PUBLISH`, so two async connections are maintained:
//!
//! - `publish_conn` - `MultiplexedConnection`, used only for `PUBLISH`
//! - `pubsub_sink` / `pubsub_stream` - split from `aio::PubSub`, used for
//!   `SUBSCRIBE` and receiving messages respectively
//!
//! `PubSubSink::subscribe()` resolves only after the broker confirms the
//! subscription, so a subscribe is acknowledged as soon as it returns.
//!
//! ## Delivery
//!
//! Incoming messages are fanned out to every local receiver of the channel.
//! Receivers that are full or dropped are evicted.

use bytes::Bytes;
use futures_util::StreamExt;

use redis::aio::{MultiplexedConnection, PubSubSink, PubSubStream};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio::task::JoinHandle;

use super::{PubSubClient, PubSubClientPtr, PubSubMessage};
use crate::{EventBusError, PubSubConfig, Result};

const INBOX_CAPACITY: usize = 256;

type SubscriberMap = Arc<RwLock<HashMap<String, Vec<mpsc::Sender<PubSubMessage>>>>>;

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        channel: String,
        payload: Bytes,
        resp: oneshot::Sender<Result<u64>>,
    },
    Subscribe {
        channel: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<()>,
    },
}

enum ActorStep {
    //
    Continue,
    Stop,
}

impl Cmd {
    // ---

    /// Dispatches an actor command to the correct handler on the actor.
    async fn handle(self, actor: &mut RedisActor) -> ActorStep {
        // ---
        match self {
            Cmd::Publish {
                channel,
                payload,
                resp,
            } => {
                let _ = resp.send(actor.handle_publish(&channel, payload).await);
                ActorStep::Continue
            }
            Cmd::Subscribe { channel, resp } => {
                let _ = resp.send(actor.handle_subscribe(&channel).await);
                ActorStep::Continue
            }
            Cmd::Close { resp } => {
                crate::log_debug!("{}: disconnecting redis client", actor.name);
                let _ = resp.send(());
                ActorStep::Stop
            }
        }
    }
}

/// Redis implementation of [`PubSubClient`].
struct RedisPubSub {
    // ---
    name: String,
    cmd_tx: mpsc::Sender<Cmd>,
    subscribers: SubscriberMap,
    actor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

struct RedisActor {
    // ---
    name: String, // for logging only
    publish_conn: MultiplexedConnection,
    pubsub_sink: PubSubSink,
    pubsub_stream: PubSubStream,
    cmd_rx: mpsc::Receiver<Cmd>,
    subscribers: SubscriberMap,
    shutdown: Arc<Notify>,
}

impl RedisActor {
    // ---

    async fn run(mut self) {
        // ---
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if matches!(cmd.handle(&mut self).await, ActorStep::Stop) {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                maybe_msg = self.pubsub_stream.next() => {
                    match maybe_msg {
                        Some(msg) => self.handle_incoming(msg).await,
                        None => {
                            crate::log_error!("{}: pubsub stream ended", self.name);
                            break;
                        }
                    }
                }

                _ = self.shutdown.notified() => break,
            }
        }

        // receivers observe end-of-stream
        self.subscribers.write().await.clear();
    }

    async fn handle_publish(&mut self, channel: &str, payload: Bytes) -> Result<u64> {
        // ---
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload.as_ref())
            .query_async::<i64>(&mut self.publish_conn)
            .await
            .map(|receivers| receivers.max(0) as u64)
            .map_err(|err| {
                let msg = format!("{}: publish failed for channel {channel}: {err}", self.name);
                crate::log_error!("{msg}");
                EventBusError::Transport(msg)
            })
    }

    async fn handle_subscribe(&mut self, channel: &str) -> Result<()> {
        // ---
        match self.pubsub_sink.subscribe(channel).await {
            Ok(()) => {
                crate::log_info!("{}: subscribed to channel {channel}", self.name);
                Ok(())
            }
            Err(err) => {
                let msg = format!("{}: failed to subscribe to channel {channel}: {err}", self.name);
                crate::log_error!("{msg}");
                Err(EventBusError::Transport(msg))
            }
        }
    }

    async fn handle_incoming(&self, msg: redis::Msg) {
        // ---
        let channel = msg.get_channel_name().to_string();
        let message = PubSubMessage {
            channel: channel.clone(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        };

        let senders = {
            let map = self.subscribers.read().await;
            map.get(&channel).cloned()
        };

        let Some(senders) = senders else {
            return;
        };

        let original_len = senders.len();
        let survivors: Vec<_> = senders
            .into_iter()
            .filter(|tx| tx.try_send(message.clone()).is_ok())
            .collect();

        if survivors.len() != original_len {
            crate::log_debug!("{}: evicted slow or closed receivers on {channel}", self.name);
            self.subscribers.write().await.insert(channel, survivors);
        }
    }
} // RedisActor

impl RedisPubSub {
    // ---
    async fn command<T>(&self, cmd: Cmd, rx: oneshot::Receiver<T>) -> Result<T> {
        // ---
        self.cmd_tx.send(cmd).await.map_err(|e| {
            EventBusError::Transport(format!("{}: actor command channel closed: {e}", self.name))
        })?;
        rx.await.map_err(|e| {
            EventBusError::Transport(format!("{}: actor response lost: {e}", self.name))
        })
    }
}

#[async_trait::async_trait]
impl PubSubClient for RedisPubSub {
    // ---
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<u64> {
        // ---
        let (resp, rx) = oneshot::channel();
        let cmd = Cmd::Publish {
            channel: channel.to_string(),
            payload,
            resp,
        };
        self.command(cmd, rx).await?
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<PubSubMessage>> {
        // ---
        let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
        self.subscribers
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .push(tx);

        let (resp, rx) = oneshot::channel();
        let cmd = Cmd::Subscribe {
            channel: channel.to_string(),
            resp,
        };
        self.command(cmd, rx).await??;
        Ok(inbox)
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (resp, rx) = oneshot::channel();
        if self.command(Cmd::Close { resp }, rx).await.is_err() {
            self.shutdown.notify_waiters();
        }

        if let Some(handle) = self.actor.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// Connect a Redis pub/sub client for `config.uri`.
///
/// # Errors
///
/// Returns `DriverInit` if the URI is missing or cannot be parsed, and
/// `Transport` if either connection cannot be established.
pub async fn connect(config: &PubSubConfig) -> Result<PubSubClientPtr> {
    // ---
    if config.uri.is_empty() {
        return Err(EventBusError::DriverInit(format!(
            "{}: redis transport requires uri",
            config.name
        )));
    }
    let uri = config.uri.as_str();

    let client = redis::Client::open(uri).map_err(|err| {
        EventBusError::DriverInit(format!("redis: failed to open client for URI {uri}: {err}"))
    })?;

    let publish_conn = client
        .get_multiplexed_async_connection()
        .await
        .map_err(|err| {
            let msg = format!("redis: failed to connect publish connection to {uri}: {err}");
            crate::log_error!("{msg}");
            EventBusError::Transport(msg)
        })?;

    let (pubsub_sink, pubsub_stream) = client
        .get_async_pubsub()
        .await
        .map_err(|err| {
            let msg = format!("redis: failed to connect pubsub connection to {uri}: {err}");
            crate::log_error!("{msg}");
            EventBusError::Transport(msg)
        })?
        .split();

    crate::log_info!("{}: connected to Redis broker at {uri}", config.name);

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let subscribers: SubscriberMap = Arc::new(RwLock::new(HashMap::new()));
    let shutdown = Arc::new(Notify::new());

    let actor = RedisActor {
        name: config.name.clone(),
        publish_conn,
        pubsub_sink,
        pubsub_stream,
        cmd_rx,
        subscribers: subscribers.clone(),
        shutdown: shutdown.clone(),
    };
    let handle = tokio::spawn(actor.run());

    Ok(Arc::new(RedisPubSub {
        name: config.name.clone(),
        cmd_tx,
        subscribers,
        actor: tokio::sync::Mutex::new(Some(handle)),
        shutdown,
    }))
}

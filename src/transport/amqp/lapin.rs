//! AMQP connection adapter using `lapin`.
//!
//! Implements the [`AmqpConnection`] and [`AmqpChannel`] seams on top of a
//! lapin connection.
//!
//! ## Concurrency model
//!
//! - lapin channels are internally synchronized, so the adapter wraps them
//!   directly; the registry serializes publishes per producer channel.
//! - Each `basic_publish` on a channel in confirm mode spawns a small task
//!   that awaits the broker confirm and forwards it to the channel's
//!   [`ConfirmListener`](super::ConfirmListener) with `multiple = false`.
//! - Each `basic_consume` spawns a task forwarding the lapin consumer stream
//!   into an mpsc inbox until the stream ends or the inbox is dropped.
//!
//! ## Connection behavior
//!
//! The connection is established eagerly in [`connect`]. Success and failure
//! are logged at info/error level respectively.

use bytes::Bytes;
use futures_lite::stream::StreamExt;

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        ConfirmSelectOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    ExchangeKind,
};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    // ---
    AmqpChannel,
    AmqpChannelPtr,
    AmqpConnection,
    AmqpConnectionPtr,
    ConfirmListenerPtr,
    Delivery,
    ExchangeBinding,
};
use crate::sync::lock_ignore_poison;
use crate::{AmqpConfig, EventBusError, Result};

const INBOX_CAPACITY: usize = 256;

fn transport_err(what: &str, err: lapin::Error) -> EventBusError {
    // ---
    let msg = format!("amqp: {what} failed: {err}");
    crate::log_error!("{msg}");
    EventBusError::Transport(msg)
}

fn exchange_kind(name: &str) -> ExchangeKind {
    // ---
    match name.to_ascii_lowercase().as_str() {
        "" | "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => ExchangeKind::Custom(other.to_string()),
    }
}

struct LapinConnection {
    name: String,
    connection: Connection,
}

#[async_trait::async_trait]
impl AmqpConnection for LapinConnection {
    // ---
    async fn create_channel(&self) -> Result<AmqpChannelPtr> {
        // ---
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| transport_err("channel creation", e))?;
        crate::log_debug!("[{}] created AMQP channel {}", self.name, channel.id());

        Ok(Arc::new(LapinChannel {
            name: self.name.clone(),
            channel,
            next_seq: AtomicU64::new(1),
            confirms: Mutex::new(None),
            consumers: Mutex::new(Vec::new()),
        }))
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.connection
            .close(200, "Normal shutdown".into())
            .await
            .map_err(|e| transport_err("connection close", e))?;
        crate::log_info!("[{}] AMQP connection closed", self.name);
        Ok(())
    }
}

struct LapinChannel {
    name: String,
    channel: Channel,
    next_seq: AtomicU64,
    confirms: Mutex<Option<ConfirmListenerPtr>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl AmqpChannel for LapinChannel {
    // ---
    async fn confirm_select(&self, listener: ConfirmListenerPtr) -> Result<()> {
        // ---
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| transport_err("confirm select", e))?;
        *lock_ignore_poison(&self.confirms) = Some(listener);
        Ok(())
    }

    fn next_publish_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Acquire)
    }

    async fn basic_publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> Result<()> {
        // ---
        let confirm = self
            .channel
            .basic_publish(
                exchange.into(),
                routing_key.into(),
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| transport_err("publish", e))?;
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);

        let listener = lock_ignore_poison(&self.confirms).clone();
        if let Some(listener) = listener {
            let name = self.name.clone();
            tokio::spawn(async move {
                match confirm.await {
                    Ok(Confirmation::Ack(_)) => listener.handle_ack(seq, false),
                    Ok(Confirmation::Nack(_)) => listener.handle_nack(seq, false),
                    Ok(Confirmation::NotRequested) => {}
                    Err(_e) => {
                        crate::log_warn!("[{name}] confirm for seq={seq} lost: {_e}");
                        listener.handle_nack(seq, false);
                    }
                }
            });
        }
        Ok(())
    }

    async fn declare(&self, binding: &ExchangeBinding) -> Result<()> {
        // ---
        let exchange_opts = ExchangeDeclareOptions {
            durable: binding.durable,
            auto_delete: binding.auto_delete,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(
                binding.exchange.as_str().into(),
                exchange_kind(&binding.exchange_type),
                exchange_opts,
                FieldTable::default(),
            )
            .await
            .map_err(|e| transport_err("exchange declare", e))?;

        let queue_opts = QueueDeclareOptions {
            durable: binding.durable,
            auto_delete: binding.auto_delete,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(binding.queue.as_str().into(), queue_opts, FieldTable::default())
            .await
            .map_err(|e| transport_err("queue declare", e))?;

        self.channel
            .queue_bind(
                binding.queue.as_str().into(),
                binding.exchange.as_str().into(),
                binding.routing_key.as_str().into(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| transport_err("queue bind", e))?;

        crate::log_info!(
            "[{}] declared {} ({}) -> {} via {}",
            self.name,
            binding.exchange,
            binding.exchange_type,
            binding.queue,
            binding.routing_key
        );
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<mpsc::Receiver<Delivery>> {
        // ---
        let mut consumer = self
            .channel
            .basic_consume(
                queue.into(),
                consumer_tag.into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| transport_err("consume", e))?;
        crate::log_info!("[{}] started consuming queue: {queue}", self.name);

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        let name = self.name.clone();
        let queue = queue.to_string();

        let handle = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(_e) => {
                        crate::log_error!("[{name}] consumer error on {queue}: {_e}");
                        break;
                    }
                };
                let forwarded = Delivery {
                    delivery_tag: delivery.delivery_tag,
                    exchange: delivery.exchange.as_str().to_string(),
                    routing_key: delivery.routing_key.as_str().to_string(),
                    body: Bytes::from(delivery.data),
                };
                if tx.send(forwarded).await.is_err() {
                    break;
                }
            }
            crate::log_info!("[{name}] consumer task ended for queue: {queue}");
        });
        lock_ignore_poison(&self.consumers).push(handle);

        Ok(rx)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        // ---
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| transport_err("ack", e))
    }

    async fn close(&self) -> Result<()> {
        // ---
        for handle in std::mem::take(&mut *lock_ignore_poison(&self.consumers)) {
            handle.abort();
        }
        lock_ignore_poison(&self.confirms).take();
        self.channel
            .close(200, "Normal shutdown".into())
            .await
            .map_err(|e| transport_err("channel close", e))
    }
}

/// Connect to the AMQP broker at `config.uri`.
///
/// # Errors
///
/// Returns `DriverInit` if the URI is missing and `Transport` if the
/// connection cannot be established.
pub async fn connect(config: &AmqpConfig) -> Result<AmqpConnectionPtr> {
    // ---
    if config.uri.is_empty() {
        return Err(EventBusError::DriverInit(format!(
            "{}: AMQP transport requires uri",
            config.name
        )));
    }

    crate::log_info!("[{}] connecting to AMQP broker: {}", config.name, config.uri);
    let connection = Connection::connect(&config.uri, ConnectionProperties::default())
        .await
        .map_err(|e| transport_err("connection", e))?;
    crate::log_info!("[{}] connected to AMQP broker", config.name);

    Ok(Arc::new(LapinConnection {
        name: config.name.clone(),
        connection,
    }))
}

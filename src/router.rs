// src/router.rs

//! Consumer router.
//!
//! Every inbound batch, whatever transport it came from, is routed here:
//!
//! 1. the batch gets a fresh correlation id;
//! 2. per listener, envelopes are kept if the topic matches and, unless the
//!    transport is groupless, the group matches;
//! 3. survivors are grouped by topic in first-seen order;
//! 4. the listener handler runs once per topic group.
//!
//! A failing group never prevents later groups from running. The first
//! failure is returned as [`EventBusError::ListenerBusiness`] after all
//! groups ran; poll loops log it and keep polling.

use std::sync::Arc;
use std::time::Instant;

use crate::{
    // ---
    EventBusError,
    EventContext,
    Envelope,
    ListenerDescriptor,
    ListenerPtr,
    Result,
    TransportKind,
};

/// Routes inbound batches of one registry to its listeners.
#[derive(Debug, Clone)]
pub struct ConsumerRouter {
    registry: Arc<str>,
    groupless: bool,
}

impl ConsumerRouter {
    // ---
    pub fn new(registry: impl Into<Arc<str>>, kind: TransportKind) -> Self {
        Self {
            registry: registry.into(),
            groupless: kind.is_groupless(),
        }
    }

    /// Whether `envelope` is addressed to `descriptor`.
    ///
    /// A descriptor topic may list several comma-separated topics.
    pub fn matches(&self, descriptor: &ListenerDescriptor, envelope: &Envelope) -> bool {
        // ---
        let topic = envelope.topic();
        let topic_ok = descriptor.topic == topic
            || descriptor.topic.split(',').any(|t| t.trim() == topic);
        topic_ok && (self.groupless || descriptor.group == envelope.group())
    }

    /// Route one batch to every listener.
    pub async fn route(&self, listeners: &[ListenerPtr], batch: Vec<Envelope>) -> Result<()> {
        // ---
        if batch.is_empty() {
            return Ok(());
        }

        let ctx = EventContext::for_batch();
        let mut first_err = None;

        for listener in listeners {
            if let Err(err) = self.dispatch(&ctx, listener, &batch).await {
                first_err.get_or_insert(err);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Route one batch to a single listener.
    pub async fn route_to(&self, listener: &ListenerPtr, batch: Vec<Envelope>) -> Result<()> {
        // ---
        if batch.is_empty() {
            return Ok(());
        }
        self.dispatch(&EventContext::for_batch(), listener, &batch).await
    }

    async fn dispatch(
        &self,
        ctx: &EventContext,
        listener: &ListenerPtr,
        batch: &[Envelope],
    ) -> Result<()> {
        // ---
        let descriptor = listener.descriptor();

        // topic -> envelopes, first-seen order
        let mut groups: Vec<(String, Vec<Envelope>)> = Vec::new();
        for envelope in batch.iter().filter(|e| self.matches(descriptor, e)) {
            let topic = envelope.topic();
            match groups.iter_mut().find(|(t, _)| t == topic) {
                Some((_, events)) => events.push(envelope.clone()),
                None => groups.push((topic.to_string(), vec![envelope.clone()])),
            }
        }

        let mut first_err = None;
        for (topic, events) in groups {
            let count = events.len();
            let started = Instant::now();
            let outcome = listener.on_batch(ctx, events).await;
            let elapsed = started.elapsed();

            match outcome {
                Ok(()) => crate::log_debug!(
                    "[{}] listener {} handled {count} event(s) on {topic} in {elapsed:?}",
                    self.registry,
                    descriptor.name
                ),
                Err(source) => {
                    crate::log_warn!(
                        "[{}] listener {} failed on {topic} after {elapsed:?}: {source}",
                        self.registry,
                        descriptor.name
                    );
                    first_err.get_or_insert(EventBusError::listener_business(source));
                }
            }
        }

        first_err.map_or(Ok(()), Err)
    }
}

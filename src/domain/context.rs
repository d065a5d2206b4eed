// src/domain/context.rs

//! Explicit trace context.
//!
//! Trace and correlation ids are passed as a value through the publish and
//! handler call chains; nothing is carried implicitly across tasks.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Random event/trace identifier: a v4 uuid without dashes.
pub fn random_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Identifier shared by every envelope of one inbound batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new unique correlation ID.
    pub fn generate() -> Self {
        Self(random_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Context handed to publish calls and listener handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    // ---
    /// Request trace id; becomes the event id of envelopes published without one.
    pub trace_id: Option<String>,

    /// Set by the consumer router, one per handled batch.
    pub correlation_id: Option<CorrelationId>,
}

impl EventContext {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: Some(trace_id.into()),
            correlation_id: None,
        }
    }

    /// Fresh context for one inbound batch.
    pub(crate) fn for_batch() -> Self {
        Self {
            trace_id: None,
            correlation_id: Some(CorrelationId::generate()),
        }
    }

    /// The trace id, or a new random id.
    pub(crate) fn event_id(&self) -> String {
        // ---
        match self.trace_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => random_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn random_ids_have_no_dashes() {
        // ---
        let id = random_id();
        assert_eq!(id.len(), 32);
        assert!(!id.contains('-'));
        assert_ne!(id, random_id());
    }

    #[test]
    fn event_id_prefers_trace_id() {
        // ---
        assert_eq!(EventContext::with_trace_id("abc").event_id(), "abc");
        assert_eq!(EventContext::with_trace_id("").event_id().len(), 32);
        assert_ne!(
            EventContext::for_batch().correlation_id,
            EventContext::for_batch().correlation_id
        );
    }
}

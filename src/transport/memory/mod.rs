// src/transport/memory/mod.rs

//! In-memory brokers.
//!
//! One pure in-process implementation of every broker client seam. They
//! back the test suite and let an application run any registry kind
//! without a broker.
//!
//! ## Reference Semantics
//!
//! The in-memory brokers define the **reference behavior** for the client
//! seams. Real client adapters are expected to approximate this behavior as
//! closely as their underlying systems allow:
//!
//! - Once a subscribe/consume call returns, messages published *after* that
//!   point and matching it are deliverable.
//! - Delivery is deterministic within a single process.
//! - No messages are dropped due to timing, scheduling, or background IO.
//!
//! ## Non-Goals
//!
//! Persistence, network behavior and failure simulation. The brokers do not
//! emulate the failure modes of any specific product.

mod amqp;
mod log;
mod ordered;
mod pubsub;

pub use amqp::MemoryAmqp;
pub use log::MemoryLog;
pub use ordered::MemoryOrdered;
pub use pubsub::MemoryPubSub;

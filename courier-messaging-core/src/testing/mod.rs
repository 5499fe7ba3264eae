//! Test doubles for the broker capability traits.
//!
//! [`MemoryBroker`] routes messages in process: default-exchange and fan-out
//! publishing, broker-named exclusive queues, round-robin consumers. Dials
//! can be failed on demand and live connections dropped, which is enough to
//! drive the connection manager through its reconnect paths.

mod memory;

pub use memory::{BrokerStats, MemoryBroker, MemoryChannel, MemoryConnection};

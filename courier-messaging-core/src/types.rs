// courier-messaging-core/src/types.rs
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::MessagingError;

/// Content type stamped on every published body.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    /// Return address: the queue a reply should be sent to.
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Fanout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Broker-named, connection-private queue used as a reply address.
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Broker acknowledges on delivery; the consumer never acks or nacks.
    pub no_ack: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub reply_to: Option<String>,
}

impl PublishProperties {
    pub fn reply_to(queue: impl Into<String>) -> Self {
        Self {
            reply_to: Some(queue.into()),
        }
    }
}

pub fn encode<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>, MessagingError> {
    Ok(serde_json::to_vec(payload)?)
}

pub fn decode(body: &[u8]) -> Result<Value, MessagingError> {
    Ok(serde_json::from_slice(body)?)
}

pub fn decode_as<T: DeserializeOwned>(body: &[u8]) -> Result<T, MessagingError> {
    Ok(serde_json::from_slice(body)?)
}

// courier-messaging-core/src/bus.rs
//! The broker capability surface the connection manager and the messaging
//! facade are written against.
//!
//! Implementations live outside this crate (`courier-messaging-rabbitmq`) or
//! in `testing` (behind the `testing` feature) for tests.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::{
    ConsumeOptions, Delivery, ExchangeKind, ExchangeOptions, MessagingError, PublishProperties,
    QueueOptions, RawTransportError,
};

pub type DeliveryStream = BoxStream<'static, Result<Delivery, MessagingError>>;

/// A started consumer: its tag plus the stream of deliveries.
pub struct Consumer {
    pub tag: String,
    pub deliveries: DeliveryStream,
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    async fn connect(&self, url: &str) -> Result<Self::Connection, RawTransportError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn create_channel(&self) -> Result<Self::Channel, MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;

    /// Resolves once the connection is gone.
    ///
    /// `Some` when the transport failed, `None` for an orderly close.
    async fn closed(&self) -> Option<RawTransportError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declares a queue and returns its name; an empty name asks the broker
    /// to generate one.
    async fn assert_queue(&self, name: &str, options: QueueOptions)
        -> Result<String, MessagingError>;

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), MessagingError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError>;

    async fn prefetch(&self, count: u16) -> Result<(), MessagingError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<(), MessagingError>;

    /// Publishes through the default exchange straight onto `queue`.
    async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<(), MessagingError> {
        self.publish("", queue, payload, properties).await
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions)
        -> Result<Consumer, MessagingError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    async fn nack(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError>;

    async fn delete_queue(&self, name: &str) -> Result<(), MessagingError>;

    async fn close(&self) -> Result<(), MessagingError>;
}

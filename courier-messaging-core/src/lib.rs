pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod messenger;
mod middleware;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use bus::{Broker, BrokerChannel, BrokerConnection, Consumer, DeliveryStream};
pub use config::{CallOptions, ConfigError, MessagingConfig, Options, Settings};
pub use connection::{backoff_delay, ConnectionEvent, ConnectionManager, ConnectionState};
pub use error::{MessagingError, RawTransportError, TransportError, TransportErrorKind};
pub use handler::RequestHandler;
pub use messenger::{Finalizer, Messenger, Subscription};
pub use types::{
    ConsumeOptions, Delivery, ExchangeKind, ExchangeOptions, PublishProperties, QueueOptions,
};

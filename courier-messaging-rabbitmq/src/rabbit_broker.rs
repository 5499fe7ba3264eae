use std::{io, sync::Arc};

use async_trait::async_trait;
use courier_messaging_core::{
    error::{ECONNREFUSED, ENOTFOUND},
    types::JSON_CONTENT_TYPE,
    Broker, BrokerChannel, BrokerConnection, ConsumeOptions, Consumer, Delivery, ExchangeKind,
    ExchangeOptions, MessagingError, PublishProperties, QueueOptions, RawTransportError,
};
use futures_util::StreamExt;
use lapin::{options::*, types::FieldTable, BasicProperties, Channel, Connection};
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::options::RabbitOptions;

const DEFAULT_PORT: u16 = 5672;

/// `None` while open; `Some(reason)` once closed.
type CloseSignal = watch::Sender<Option<Option<RawTransportError>>>;

/// Dials RabbitMQ through lapin.
#[derive(Clone, Debug, Default)]
pub struct RabbitBroker {
    options: RabbitOptions,
}

impl RabbitBroker {
    pub fn new(options: RabbitOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Broker for RabbitBroker {
    type Connection = RabbitConnection;

    async fn connect(&self, url: &str) -> Result<RabbitConnection, RawTransportError> {
        let endpoint = Endpoint::parse(url);
        let connection = Connection::connect(url, self.options.connection_properties())
            .await
            .map_err(|e| endpoint.raw_error(&e))?;

        let (signal, _) = watch::channel(None);
        let signal: Arc<CloseSignal> = Arc::new(signal);

        let on_error = Arc::clone(&signal);
        let error_endpoint = endpoint.clone();
        connection.on_error(move |e| {
            let reason = error_endpoint.raw_error(&e);
            on_error.send_if_modified(|state| {
                if state.is_none() {
                    *state = Some(Some(reason));
                    true
                } else {
                    false
                }
            });
        });

        info!(host = %endpoint.host, port = endpoint.port, "RabbitMQ connected");
        Ok(RabbitConnection {
            inner: connection,
            signal,
            confirms: self.options.confirms,
        })
    }
}

pub struct RabbitConnection {
    inner: Connection,
    signal: Arc<CloseSignal>,
    confirms: bool,
}

#[async_trait]
impl BrokerConnection for RabbitConnection {
    type Channel = RabbitChannel;

    async fn create_channel(&self) -> Result<RabbitChannel, MessagingError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| MessagingError::Channel(e.to_string()))?;

        if self.confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| MessagingError::Channel(e.to_string()))?;
        }

        Ok(RabbitChannel {
            inner: channel,
            confirms: self.confirms,
        })
    }

    async fn close(&self) -> Result<(), MessagingError> {
        // orderly close: closed() resolves with no reason
        self.signal.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(None);
                true
            } else {
                false
            }
        });

        if self.inner.status().connected() {
            self.inner
                .close(200, "OK")
                .await
                .map_err(|e| MessagingError::Transport(RawTransportError::new(e.to_string()).into()))?;
        }
        Ok(())
    }

    async fn closed(&self) -> Option<RawTransportError> {
        let mut rx = self.signal.subscribe();
        let reason = match rx.wait_for(|state| state.is_some()).await {
            Ok(state) => (*state).clone().flatten(),
            Err(_) => None,
        };
        reason
    }
}

pub struct RabbitChannel {
    inner: Channel,
    confirms: bool,
}

#[async_trait]
impl BrokerChannel for RabbitChannel {
    async fn assert_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, MessagingError> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Declare(e.to_string()))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), MessagingError> {
        let kind = match kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.inner
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                    passive: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Declare(e.to_string()))
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Declare(e.to_string()))
    }

    async fn prefetch(&self, count: u16) -> Result<(), MessagingError> {
        self.inner
            .basic_qos(count, BasicQosOptions { global: false })
            .await
            .map_err(|e| MessagingError::Channel(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<(), MessagingError> {
        let mut basic = BasicProperties::default().with_content_type(JSON_CONTENT_TYPE.into());
        if let Some(reply_to) = properties.reply_to {
            basic = basic.with_reply_to(reply_to.into());
        }

        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                payload,
                basic,
            )
            .await
            .map_err(|e| MessagingError::Publish(e.to_string()))?;

        if self.confirms {
            let confirmation = confirm
                .await
                .map_err(|e| MessagingError::Publish(e.to_string()))?;
            if confirmation.is_nack() {
                return Err(MessagingError::Publish("publisher confirm NACK".to_string()));
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Consumer, MessagingError> {
        let tag = format!("courier-{}", Uuid::new_v4().simple());
        let consumer = self
            .inner
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: false,
                    nowait: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::Subscribe(e.to_string()))?;

        let deliveries = consumer
            .map(|delivery| {
                delivery
                    .map(|d| Delivery {
                        delivery_tag: d.delivery_tag,
                        reply_to: d.properties.reply_to().as_ref().map(|r| r.as_str().to_string()),
                        body: d.data,
                    })
                    .map_err(|e| MessagingError::Subscribe(e.to_string()))
            })
            .boxed();

        debug!(queue, consumer_tag = %tag, "basic.consume ok");
        Ok(Consumer { tag, deliveries })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|e| MessagingError::Channel(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: false,
                },
            )
            .await
            .map_err(|e| MessagingError::Channel(e.to_string()))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| MessagingError::Channel(e.to_string()))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), MessagingError> {
        self.inner
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::Channel(e.to_string()))
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner.close(200, "OK").await.map_err(|e| {
            error!(error = %e, channel_id = self.inner.id(), "channel close failed");
            MessagingError::Channel(e.to_string())
        })
    }
}

/// Host and port the URL points at, carried into classified dial errors.
#[derive(Clone, Debug, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    fn parse(url: &str) -> Self {
        let parsed = url::Url::parse(url).ok();
        let host = parsed
            .as_ref()
            .and_then(|u| u.host_str())
            .unwrap_or("localhost")
            .to_string();
        // `amqp` is not a special scheme, so the url crate knows no default port
        let port = parsed.as_ref().and_then(|u| u.port()).unwrap_or(DEFAULT_PORT);
        Self { host, port }
    }

    fn raw_error(&self, error: &lapin::Error) -> RawTransportError {
        let raw = RawTransportError::new(error.to_string()).with_endpoint(&self.host, self.port);
        match error_code(error) {
            Some(code) => raw.with_code(code),
            None => raw,
        }
    }
}

fn error_code(error: &lapin::Error) -> Option<&'static str> {
    let lapin::Error::IOError(io) = error else {
        return None;
    };
    io_error_code(io)
}

fn io_error_code(error: &io::Error) -> Option<&'static str> {
    if error.kind() == io::ErrorKind::ConnectionRefused {
        return Some(ECONNREFUSED);
    }
    let message = error.to_string();
    let lookup_failed = [
        "failed to lookup address",
        "Name or service not known",
        "nodename nor servname provided",
        "No such host is known",
    ]
    .iter()
    .any(|needle| message.contains(needle));
    lookup_failed.then_some(ENOTFOUND)
}

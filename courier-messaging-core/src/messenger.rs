// courier-messaging-core/src/messenger.rs
//! Request/reply and broadcast/collect on top of [`ConnectionManager`].
//!
//! Every call opens its own channel and closes it when done. Subscriptions
//! (`on_queue`, `on_broadcast`) keep one channel for as long as they run.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::StreamExt;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{sleep, timeout, timeout_at, Instant},
};
use tracing::{debug, error, info, Instrument};

use crate::{
    bus::{Broker, BrokerChannel, Consumer},
    connection::{backoff_delay, ChannelOf, ConnectionManager},
    middleware::Middleware,
    types::{decode, decode_as, encode},
    CallOptions, ConsumeOptions, ExchangeKind, ExchangeOptions, MessagingError, Options,
    PublishProperties, QueueOptions, RequestHandler, Settings,
};

/// Guards a cleanup that must run at most once.
#[derive(Debug, Default)]
pub struct Finalizer(AtomicBool);

impl Finalizer {
    /// True for the first caller only.
    pub fn try_finalize(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_finalized(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Handle to a running `on_queue` / `on_broadcast` consumer.
///
/// Dropping the handle leaves the consumer running; call
/// [`cancel`](Subscription::cancel) to stop it.
pub struct Subscription {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub async fn cancel(self) {
        self.cancel.send_replace(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "subscription task failed");
        }
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

#[derive(Debug, Clone)]
enum Source {
    Queue(String),
    Broadcast(String),
}

type Attached<C> = (Arc<C>, Consumer);

/// The messaging facade.
pub struct Messenger<B: Broker> {
    manager: ConnectionManager<B>,
    options: Options,
}

impl<B: Broker> Clone for Messenger<B> {
    fn clone(&self) -> Self {
        Self {
            manager: self.manager.clone(),
            options: self.options.clone(),
        }
    }
}

impl<B: Broker> Messenger<B> {
    pub fn new(broker: B, settings: Settings, options: Options) -> Self {
        let manager = ConnectionManager::new(broker, &settings, &options);
        Self { manager, options }
    }

    pub fn manager(&self) -> &ConnectionManager<B> {
        &self.manager
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub async fn close(&self) {
        self.manager.close().await;
    }

    /// Fire-and-forget send onto `queue`.
    pub async fn queue<T>(
        &self,
        queue: &str,
        _call: CallOptions,
        request: &T,
    ) -> Result<(), MessagingError>
    where
        T: Serialize + ?Sized,
    {
        let body = encode(request)?;
        let channel = self.open_channel().await?;

        let result = async {
            channel
                .assert_queue(queue, QueueOptions::default())
                .await
                .map_err(|e| declare_failed(queue, e))?;
            channel
                .send_to_queue(queue, &body, PublishProperties::default())
                .await
        }
        .instrument(self.options.span.clone())
        .await;

        close_channel(channel.as_ref()).await;
        if let Err(e) = &result {
            error!(parent: &self.options.span, error = %e, queue, "queue send failed");
        } else {
            debug!(parent: &self.options.span, queue, "request queued");
        }
        result
    }

    /// Sends `request` onto `queue` and waits for the first reply.
    ///
    /// The reply consumer is armed before the request is published. The wait
    /// is unbounded unless `timeout_ms` is set on the call or the facade.
    pub async fn queue_rpc<T, R>(
        &self,
        queue: &str,
        call: CallOptions,
        request: &T,
    ) -> Result<R, MessagingError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let options = self.options.merged(&call);
        let body = encode(request)?;
        let channel = self.open_channel().await?;

        let armed = async {
            channel
                .assert_queue(queue, QueueOptions::default())
                .await
                .map_err(|e| declare_failed(queue, e))?;
            let reply_queue = channel
                .assert_queue("", QueueOptions::exclusive())
                .await
                .map_err(|e| declare_failed("reply queue", e))?;
            let consumer = channel
                .consume(&reply_queue, ConsumeOptions { no_ack: true })
                .await?;
            Ok::<_, MessagingError>((reply_queue, consumer))
        }
        .await;

        let (reply_queue, mut consumer) = match armed {
            Ok(armed) => armed,
            Err(e) => {
                error!(parent: &options.span, error = %e, queue, "rpc setup failed");
                close_channel(channel.as_ref()).await;
                return Err(e);
            }
        };

        let reply = async {
            channel
                .send_to_queue(queue, &body, PublishProperties::reply_to(&reply_queue))
                .await?;
            debug!(queue, reply_queue = %reply_queue, "rpc request sent");

            let next = match options.timeout_ms {
                Some(ms) => timeout(Duration::from_millis(ms), consumer.deliveries.next())
                    .await
                    .map_err(|_| MessagingError::Timeout(ms))?,
                None => consumer.deliveries.next().await,
            };
            match next {
                Some(Ok(delivery)) => Ok(delivery),
                Some(Err(e)) => Err(e),
                None => Err(MessagingError::Subscribe(
                    "reply consumer closed before a reply arrived".into(),
                )),
            }
        }
        .instrument(options.span.clone())
        .await;

        drop(consumer);
        delete_queue(channel.as_ref(), &reply_queue).await;
        close_channel(channel.as_ref()).await;

        match reply {
            Ok(delivery) => decode_as(&delivery.body),
            Err(e) => {
                error!(parent: &options.span, error = %e, queue, "rpc failed");
                Err(e)
            }
        }
    }

    /// Consumes `queue`, handing every request to `handler`.
    ///
    /// Prefetch defaults to 1. With `ack` the consumer runs in manual-ack mode
    /// and the middleware settles each delivery after the handler finishes.
    pub async fn on_queue<H>(
        &self,
        queue: &str,
        call: CallOptions,
        handler: H,
    ) -> Result<Subscription, MessagingError>
    where
        H: RequestHandler,
    {
        let options = self.options.merged(&call);
        self.subscribe(Source::Queue(queue.to_string()), options, Arc::new(handler))
            .await
    }

    /// Fire-and-forget publish on a fan-out exchange.
    pub async fn broadcast<T>(
        &self,
        exchange: &str,
        _call: CallOptions,
        request: &T,
    ) -> Result<(), MessagingError>
    where
        T: Serialize + ?Sized,
    {
        let body = encode(request)?;
        let channel = self.open_channel().await?;

        let result = async {
            declare_fanout(channel.as_ref(), exchange).await?;
            channel
                .publish(exchange, "", &body, PublishProperties::default())
                .await
        }
        .await;

        close_channel(channel.as_ref()).await;
        if let Err(e) = &result {
            error!(parent: &self.options.span, error = %e, exchange, "broadcast failed");
        }
        result
    }

    /// Publishes on a fan-out exchange and collects replies in arrival order.
    ///
    /// Stops at the deadline (`timeout_ms`, default 5000ms) or once `max`
    /// replies arrived, whichever comes first. Replies arriving after that are
    /// dropped with the reply queue.
    pub async fn broadcast_collect<T>(
        &self,
        exchange: &str,
        call: CallOptions,
        request: &T,
    ) -> Result<Vec<Value>, MessagingError>
    where
        T: Serialize + ?Sized,
    {
        let options = self.options.merged(&call);
        let body = encode(request)?;
        let channel = self.open_channel().await?;

        let armed = async {
            declare_fanout(channel.as_ref(), exchange).await?;
            let reply_queue = channel
                .assert_queue("", QueueOptions::exclusive())
                .await
                .map_err(|e| declare_failed("reply queue", e))?;
            let consumer = channel
                .consume(&reply_queue, ConsumeOptions { no_ack: true })
                .await?;
            Ok::<_, MessagingError>((reply_queue, consumer))
        }
        .await;

        let (reply_queue, mut consumer) = match armed {
            Ok(armed) => armed,
            Err(e) => {
                error!(parent: &options.span, error = %e, exchange, "broadcast setup failed");
                close_channel(channel.as_ref()).await;
                return Err(e);
            }
        };

        let collection = Finalizer::default();
        if let Err(e) = channel
            .publish(exchange, "", &body, PublishProperties::reply_to(&reply_queue))
            .await
        {
            error!(parent: &options.span, error = %e, exchange, "broadcast publish failed");
            finish_collection(&collection, channel.as_ref(), &consumer.tag, &reply_queue).await;
            return Err(e);
        }

        let deadline = Instant::now() + options.broadcast_timeout();
        let mut replies = Vec::new();
        loop {
            if options.max.is_some_and(|max| replies.len() >= max) {
                debug!(parent: &options.span, exchange, "collected max replies");
                break;
            }
            match timeout_at(deadline, consumer.deliveries.next()).await {
                Err(_) => {
                    debug!(parent: &options.span, exchange, replies = replies.len(), "collection deadline reached");
                    break;
                }
                Ok(Some(Ok(delivery))) => match decode(&delivery.body) {
                    Ok(reply) => replies.push(reply),
                    Err(e) => error!(parent: &options.span, error = %e, "discarding undecodable reply"),
                },
                Ok(Some(Err(e))) => {
                    error!(parent: &options.span, error = %e, "reply consumer failed");
                    break;
                }
                Ok(None) => break,
            }
        }

        finish_collection(&collection, channel.as_ref(), &consumer.tag, &reply_queue).await;
        Ok(replies)
    }

    /// Subscribes to a fan-out exchange through a private, broker-named queue.
    ///
    /// Every subscriber sees every broadcast. Deliveries are auto-acked.
    pub async fn on_broadcast<H>(
        &self,
        exchange: &str,
        handler: H,
    ) -> Result<Subscription, MessagingError>
    where
        H: RequestHandler,
    {
        let options = Options {
            ack: false,
            ..self.options.clone()
        };
        self.subscribe(
            Source::Broadcast(exchange.to_string()),
            options,
            Arc::new(handler),
        )
        .await
    }

    async fn open_channel(&self) -> Result<Arc<ChannelOf<B>>, MessagingError> {
        match self.manager.channel().await {
            Ok(channel) => Ok(Arc::new(channel)),
            Err(e) => {
                error!(parent: &self.options.span, error = %e, "failed to open channel");
                Err(e)
            }
        }
    }

    async fn subscribe(
        &self,
        source: Source,
        options: Options,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Subscription, MessagingError> {
        let attached = self.attach(&source, &options).await?;
        let (cancel, cancelled) = watch::channel(false);

        let span = options.span.clone();
        let task = tokio::spawn(
            self.clone()
                .consume(source, options, handler, attached, cancelled)
                .instrument(span),
        );
        Ok(Subscription { cancel, task })
    }

    async fn attach(
        &self,
        source: &Source,
        options: &Options,
    ) -> Result<Attached<ChannelOf<B>>, MessagingError> {
        let channel = self.open_channel().await?;

        let consumer = match source {
            Source::Queue(queue) => {
                async {
                    channel
                        .assert_queue(queue, QueueOptions::default())
                        .await
                        .map_err(|e| declare_failed(queue, e))?;
                    channel.prefetch(options.effective_prefetch()).await?;
                    channel
                        .consume(queue, ConsumeOptions { no_ack: !options.ack })
                        .await
                }
                .await
            }
            Source::Broadcast(exchange) => {
                async {
                    declare_fanout(channel.as_ref(), exchange).await?;
                    let queue = channel
                        .assert_queue("", QueueOptions::exclusive())
                        .await
                        .map_err(|e| declare_failed("subscriber queue", e))?;
                    channel.bind_queue(&queue, exchange, "").await?;
                    channel
                        .consume(&queue, ConsumeOptions { no_ack: true })
                        .await
                }
                .await
            }
        };

        match consumer {
            Ok(consumer) => {
                info!(parent: &options.span, source = ?source, consumer_tag = %consumer.tag, "consuming");
                Ok((channel, consumer))
            }
            Err(e) => {
                error!(parent: &options.span, error = %e, source = ?source, "failed to start consumer");
                close_channel(channel.as_ref()).await;
                Err(e)
            }
        }
    }

    /// Subscription loop. With `retry_on_error` a consumer that dies with its
    /// channel or connection is re-attached, paced by the backoff sequence.
    async fn consume(
        self,
        source: Source,
        options: Options,
        handler: Arc<dyn RequestHandler>,
        mut attached: Attached<ChannelOf<B>>,
        mut cancelled: watch::Receiver<bool>,
    ) {
        let ack = matches!(source, Source::Queue(_)) && options.ack;

        loop {
            let (channel, mut consumer) = attached;
            let middleware = Arc::new(Middleware::new(
                Arc::clone(&channel),
                Arc::clone(&handler),
                ack,
                options.span.clone(),
            ));

            let stopped = loop {
                tokio::select! {
                    _ = cancellation(&mut cancelled) => break true,
                    next = consumer.deliveries.next() => match next {
                        Some(Ok(delivery)) => middleware.dispatch(delivery),
                        Some(Err(e)) => {
                            error!(error = %e, "delivery error");
                            break false;
                        }
                        None => break false,
                    },
                }
            };

            if stopped {
                if let Err(e) = channel.cancel(&consumer.tag).await {
                    error!(error = %e, consumer_tag = %consumer.tag, "failed to cancel consumer");
                }
                close_channel(channel.as_ref()).await;
                info!(source = ?source, "subscription cancelled");
                return;
            }

            info!(source = ?source, "consumer stopped");
            close_channel(channel.as_ref()).await;
            if !options.retry_on_error || self.manager.is_exiting() {
                return;
            }

            let mut attempt = 0;
            attached = loop {
                match self.attach(&source, &options).await {
                    Ok(attached) => break attached,
                    Err(MessagingError::Closed) => return,
                    Err(_) => {
                        attempt += 1;
                        let delay = backoff_delay(&options.timeout, attempt);
                        tokio::select! {
                            _ = cancellation(&mut cancelled) => return,
                            _ = sleep(delay) => {}
                        }
                    }
                }
            };
            info!(source = ?source, "consumer re-attached");
        }
    }
}

/// Resolves once cancellation is requested; a dropped [`Subscription`] never
/// cancels.
async fn cancellation(cancelled: &mut watch::Receiver<bool>) {
    if cancelled.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn declare_fanout<C: BrokerChannel>(channel: &C, exchange: &str) -> Result<(), MessagingError> {
    channel
        .assert_exchange(exchange, ExchangeKind::Fanout, ExchangeOptions { durable: false })
        .await
        .map_err(|e| declare_failed(exchange, e))
}

fn declare_failed(name: &str, e: MessagingError) -> MessagingError {
    match e {
        MessagingError::Declare(_) => e,
        other => MessagingError::Declare(format!("{name}: {other}")),
    }
}

/// Cancel, delete, close. Runs once per collection no matter who calls it.
async fn finish_collection<C: BrokerChannel>(
    collection: &Finalizer,
    channel: &C,
    consumer_tag: &str,
    reply_queue: &str,
) {
    if !collection.try_finalize() {
        return;
    }
    if let Err(e) = channel.cancel(consumer_tag).await {
        error!(error = %e, consumer_tag, "failed to cancel reply consumer");
    }
    delete_queue(channel, reply_queue).await;
    close_channel(channel).await;
}

async fn delete_queue<C: BrokerChannel>(channel: &C, queue: &str) {
    if let Err(e) = channel.delete_queue(queue).await {
        error!(error = %e, queue, "failed to delete reply queue");
    }
}

async fn close_channel<C: BrokerChannel>(channel: &C) {
    if let Err(e) = channel.close().await {
        debug!(error = %e, "channel close failed");
    }
}

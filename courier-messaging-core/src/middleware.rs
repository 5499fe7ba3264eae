// courier-messaging-core/src/middleware.rs
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, error, Instrument, Span};

use crate::{
    bus::BrokerChannel,
    types::{decode, encode},
    Delivery, PublishProperties, RequestHandler,
};

/// Sits between a consumer stream and a [`RequestHandler`].
///
/// Every delivery runs in its own task: a failing or panicking handler is
/// logged there and never reaches the consumer loop.
pub(crate) struct Middleware<C: BrokerChannel> {
    channel: Arc<C>,
    handler: Arc<dyn RequestHandler>,
    /// Manual-ack mode: settle every delivery with ack or nack.
    ack: bool,
    span: Span,
}

impl<C: BrokerChannel> Middleware<C> {
    pub(crate) fn new(
        channel: Arc<C>,
        handler: Arc<dyn RequestHandler>,
        ack: bool,
        span: Span,
    ) -> Self {
        Self {
            channel,
            handler,
            ack,
            span,
        }
    }

    pub(crate) fn dispatch(self: &Arc<Self>, delivery: Delivery) {
        let this = Arc::clone(self);
        let span = self.span.clone();
        tokio::spawn(async move { this.handle(delivery).await }.instrument(span));
    }

    pub(crate) async fn handle(&self, delivery: Delivery) {
        let request = match decode(&delivery.body) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, delivery_tag = delivery.delivery_tag, "dropping undecodable message");
                self.settle(delivery.delivery_tag, false).await;
                return;
            }
        };

        let outcome = AssertUnwindSafe(self.handler.handle(request))
            .catch_unwind()
            .await;

        let handled = match outcome {
            Ok(Ok(reply)) => self.respond(&delivery, reply).await,
            Ok(Err(e)) => {
                error!(error = %e, "handler failed");
                false
            }
            Err(panic) => {
                error!(panic = %panic_message(panic.as_ref()), "handler panicked");
                false
            }
        };

        self.settle(delivery.delivery_tag, handled).await;
    }

    async fn respond(&self, delivery: &Delivery, reply: Option<Value>) -> bool {
        let (Some(reply_to), Some(reply)) = (delivery.reply_to.as_deref(), reply) else {
            return true;
        };

        let body = match encode(&reply) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "failed to encode reply");
                return false;
            }
        };

        match self
            .channel
            .send_to_queue(reply_to, &body, PublishProperties::default())
            .await
        {
            Ok(()) => {
                debug!(reply_to, "reply sent");
                true
            }
            Err(e) => {
                error!(error = %e, reply_to, "failed to send reply");
                false
            }
        }
    }

    async fn settle(&self, delivery_tag: u64, handled: bool) {
        if !self.ack {
            return;
        }
        let result = if handled {
            self.channel.ack(delivery_tag).await
        } else {
            self.channel.nack(delivery_tag).await
        };
        if let Err(e) = result {
            error!(error = %e, delivery_tag, "failed to settle delivery");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

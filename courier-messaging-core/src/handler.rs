// courier-messaging-core/src/handler.rs
use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::MessagingError;

/// Application logic behind `on_queue` / `on_broadcast`.
///
/// Returning `Ok(Some(reply))` answers the sender when the request carried a
/// return address. `Ok(None)` consumes the request without replying.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Value) -> Result<Option<Value>, MessagingError>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>, MessagingError>> + Send + 'static,
{
    async fn handle(&self, request: Value) -> Result<Option<Value>, MessagingError> {
        (self)(request).await
    }
}

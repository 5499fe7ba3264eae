// courier-messaging-core/src/connection.rs
//! Connection lifecycle: one cached broker connection, one shared in-flight
//! dial, backoff-paced reconnection and a terminal exiting state.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::sleep,
};
use tracing::{error, info, Instrument, Span};

use crate::{
    bus::{Broker, BrokerConnection},
    MessagingError, Options, RawTransportError, Settings, TransportError,
};

const EVENT_CAPACITY: usize = 64;

pub type ConnectionOf<B> = <B as Broker>::Connection;
pub type ChannelOf<B> = <<B as Broker>::Connection as BrokerConnection>::Channel;

type Dial<C> = Shared<BoxFuture<'static, Result<Arc<C>, MessagingError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Exiting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Error(TransportError),
    Reconnecting { attempt: u32, delay: Duration },
}

/// Delay before retry number `attempt` (1-based); clamped to the last entry.
pub fn backoff_delay(sequence: &[u64], attempt: u32) -> Duration {
    let index = (attempt.saturating_sub(1) as usize).min(sequence.len().saturating_sub(1));
    Duration::from_millis(sequence.get(index).copied().unwrap_or(0))
}

enum Slot<C> {
    Idle,
    Pending(Dial<C>),
    Ready(Arc<C>),
}

struct Lifecycle<C> {
    slot: Slot<C>,
    state: ConnectionState,
}

struct Inner<B: Broker> {
    broker: B,
    url: String,
    backoff: Vec<u64>,
    span: Span,
    lifecycle: Mutex<Lifecycle<B::Connection>>,
    reconnects: AtomicU32,
    events: broadcast::Sender<ConnectionEvent>,
    exiting: watch::Sender<bool>,
}

/// Owns the broker connection for every operation built on top of it.
///
/// Cloning is cheap and yields a handle to the same connection.
pub struct ConnectionManager<B: Broker> {
    inner: Arc<Inner<B>>,
}

impl<B: Broker> Clone for ConnectionManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Broker> ConnectionManager<B> {
    /// Builds a manager without dialing; the first [`connection`](Self::connection)
    /// call starts the dial.
    pub fn new(broker: B, settings: &Settings, options: &Options) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (exiting, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                broker,
                url: settings.amqp_url(options.heartbeat),
                backoff: options.timeout.clone(),
                span: options.span.clone(),
                lifecycle: Mutex::new(Lifecycle {
                    slot: Slot::Idle,
                    state: ConnectionState::Idle,
                }),
                reconnects: AtomicU32::new(0),
                events,
                exiting,
            }),
        }
    }

    /// The current connection, or the one being dialed.
    ///
    /// Concurrent callers share a single dial. While connected every call
    /// returns the same `Arc`.
    pub async fn connection(&self) -> Result<Arc<ConnectionOf<B>>, MessagingError> {
        let dial = {
            let mut lifecycle = self.inner.lock();
            match &lifecycle.slot {
                Slot::Ready(connection) => return Ok(Arc::clone(connection)),
                Slot::Pending(dial) => dial.clone(),
                Slot::Idle => {
                    if lifecycle.state == ConnectionState::Exiting {
                        return Err(MessagingError::Closed);
                    }
                    Inner::start_dial(&self.inner, &mut lifecycle, ConnectionState::Connecting)
                }
            }
        };
        dial.await
    }

    /// Opens a fresh channel on the current (or next) connection.
    pub async fn channel(&self) -> Result<ChannelOf<B>, MessagingError> {
        let connection = self.connection().await?;
        connection.create_channel().await
    }

    /// Enters the exiting state and closes the connection. Idempotent.
    ///
    /// A dial still in flight is abandoned and its waiters get the last dial
    /// error (or [`MessagingError::Closed`]).
    pub async fn close(&self) {
        let connection = {
            let mut lifecycle = self.inner.lock();
            lifecycle.state = ConnectionState::Exiting;
            match std::mem::replace(&mut lifecycle.slot, Slot::Idle) {
                Slot::Ready(connection) => Some(connection),
                Slot::Pending(_) | Slot::Idle => None,
            }
        };
        self.inner.exiting.send_replace(true);

        if let Some(connection) = connection {
            async {
                match connection.close().await {
                    Ok(()) => info!("connection closed"),
                    Err(e) => error!(error = %e, "failed to close connection"),
                }
            }
            .instrument(self.inner.span.clone())
            .await;
        }
    }

    /// Calls [`close`](Self::close) once `signal` resolves.
    pub fn close_on<F>(&self, signal: F) -> JoinHandle<()>
    where
        F: Future + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(
            async move {
                signal.await;
                info!("shutdown requested");
                manager.close().await;
            }
            .instrument(self.inner.span.clone()),
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_exiting(&self) -> bool {
        *self.inner.exiting.borrow()
    }

    /// Consecutive failed dials since the last successful one.
    pub fn reconnect_count(&self) -> u32 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn span(&self) -> &Span {
        &self.inner.span
    }
}

impl<B: Broker> Inner<B> {
    fn lock(&self) -> MutexGuard<'_, Lifecycle<B::Connection>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }

    fn is_exiting(&self) -> bool {
        *self.exiting.borrow()
    }

    /// Caller holds the lifecycle lock, so at most one dial is ever pending.
    fn start_dial(
        inner: &Arc<Self>,
        lifecycle: &mut Lifecycle<B::Connection>,
        state: ConnectionState,
    ) -> Dial<B::Connection> {
        let task = tokio::spawn(Self::dial(Arc::downgrade(inner)).instrument(inner.span.clone()));
        let dial = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(MessagingError::Transport(TransportError::classify(
                    RawTransportError::new(format!("dial task failed: {e}")),
                ))),
            }
        }
        .boxed()
        .shared();

        lifecycle.slot = Slot::Pending(dial.clone());
        lifecycle.state = state;
        dial
    }

    /// Holds only a weak handle between attempts; stops once every manager
    /// handle is gone.
    async fn dial(weak: Weak<Self>) -> Result<Arc<B::Connection>, MessagingError> {
        loop {
            let Some(inner) = weak.upgrade() else {
                return Err(MessagingError::Closed);
            };
            match inner.broker.connect(&inner.url).await {
                Ok(connection) => {
                    let connection = Arc::new(connection);
                    inner.reconnects.store(0, Ordering::SeqCst);

                    let abandoned = {
                        let mut lifecycle = inner.lock();
                        if lifecycle.state == ConnectionState::Exiting {
                            true
                        } else {
                            lifecycle.slot = Slot::Ready(Arc::clone(&connection));
                            lifecycle.state = ConnectionState::Connected;
                            false
                        }
                    };
                    if abandoned {
                        if let Err(e) = connection.close().await {
                            error!(error = %e, "failed to close abandoned connection");
                        }
                        return Err(MessagingError::Closed);
                    }

                    Self::watch(&inner, Arc::clone(&connection));
                    info!("connected");
                    inner.emit(ConnectionEvent::Connected);
                    return Ok(connection);
                }
                Err(raw) => {
                    let error = TransportError::classify(raw);
                    if inner.is_exiting() {
                        return Err(error.into());
                    }

                    error!(error = %error, "connection failed");
                    inner.emit(ConnectionEvent::Error(error.clone()));

                    let attempt = inner.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
                    let delay = backoff_delay(&inner.backoff, attempt);
                    info!(attempt, "reconnect in {}ms", delay.as_millis());
                    inner.emit(ConnectionEvent::Reconnecting { attempt, delay });

                    let exiting = inner.exiting.subscribe();
                    drop(inner);
                    if !interruptible_sleep(exiting, delay).await {
                        info!("exiting, dial abandoned");
                        return Err(error.into());
                    }
                }
            }
        }
    }

    /// One watcher task per connection; it ends when the connection goes
    /// away or the manager exits.
    fn watch(inner: &Arc<Self>, connection: Arc<B::Connection>) {
        let weak = Arc::downgrade(inner);
        let mut exiting = inner.exiting.subscribe();
        tokio::spawn(
            async move {
                let reason = tokio::select! {
                    reason = connection.closed() => reason,
                    _ = exiting.wait_for(|exiting| *exiting) => return,
                };
                if let Some(inner) = weak.upgrade() {
                    inner.on_closed(&connection, reason);
                }
            }
            .instrument(inner.span.clone()),
        );
    }

    fn on_closed(
        self: &Arc<Self>,
        connection: &Arc<B::Connection>,
        reason: Option<RawTransportError>,
    ) {
        if let Some(raw) = reason {
            let error = TransportError::classify(raw);
            error!(error = %error, "connection error");
            self.emit(ConnectionEvent::Error(error));
        }

        let mut lifecycle = self.lock();
        if matches!(&lifecycle.slot, Slot::Ready(current) if Arc::ptr_eq(current, connection)) {
            lifecycle.slot = Slot::Idle;
        }
        if lifecycle.state == ConnectionState::Exiting {
            return;
        }

        info!("disconnected");
        self.emit(ConnectionEvent::Disconnected);
        if matches!(lifecycle.slot, Slot::Idle) {
            let _ = Self::start_dial(self, &mut lifecycle, ConnectionState::Reconnecting);
        }
    }
}

/// Returns false when the manager started exiting, or went away, during
/// the wait.
async fn interruptible_sleep(mut exiting: watch::Receiver<bool>, delay: Duration) -> bool {
    if *exiting.borrow_and_update() {
        return false;
    }
    tokio::select! {
        _ = exiting.wait_for(|exiting| *exiting) => false,
        _ = sleep(delay) => true,
    }
}

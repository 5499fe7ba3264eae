use std::{
    collections::{HashMap, VecDeque},
    mem,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::{
    bus::{Broker, BrokerChannel, BrokerConnection, Consumer},
    ConsumeOptions, Delivery, ExchangeKind, ExchangeOptions, MessagingError, PublishProperties,
    QueueOptions, RawTransportError,
};

/// `None` while open; `Some(reason)` once closed.
type CloseSignal = watch::Sender<Option<Option<RawTransportError>>>;

/// Counters and logs of what the broker has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub dials: usize,
    pub connections_opened: usize,
    pub channels_opened: usize,
    pub channels_closed: usize,
    pub published: usize,
    pub prefetch: Vec<u16>,
    pub acks: Vec<u64>,
    pub nacks: Vec<u64>,
    pub cancelled: Vec<String>,
    pub deleted_queues: Vec<String>,
}

struct Subscriber {
    tag: String,
    connection: u64,
    channel: u64,
    tx: mpsc::UnboundedSender<Result<Delivery, MessagingError>>,
}

struct Queue {
    /// Owning connection of an exclusive queue.
    owner: Option<u64>,
    backlog: VecDeque<Delivery>,
    subscribers: Vec<Subscriber>,
    cursor: usize,
}

impl Queue {
    fn new(owner: Option<u64>) -> Self {
        Self {
            owner,
            backlog: VecDeque::new(),
            subscribers: Vec::new(),
            cursor: 0,
        }
    }

    fn push(&mut self, delivery: Delivery) {
        self.subscribers.retain(|s| !s.tx.is_closed());
        if self.subscribers.is_empty() {
            self.backlog.push_back(delivery);
            return;
        }
        let index = self.cursor % self.subscribers.len();
        self.cursor = self.cursor.wrapping_add(1);
        let _ = self.subscribers[index].tx.send(Ok(delivery));
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    /// Fan-out exchange name to bound queue names.
    exchanges: HashMap<String, Vec<String>>,
    connections: HashMap<u64, Arc<CloseSignal>>,
    failures: VecDeque<RawTransportError>,
    down: Option<RawTransportError>,
    next_id: u64,
    stats: BrokerStats,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        reply_to: Option<String>,
    ) -> Result<(), MessagingError> {
        let targets = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            self.exchanges.get(exchange).cloned().ok_or_else(|| {
                MessagingError::Publish(format!("NOT_FOUND - no exchange '{exchange}'"))
            })?
        };

        self.stats.published += 1;
        for target in targets {
            let delivery_tag = self.next_id();
            // unroutable messages are dropped, as on a real broker
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.push(Delivery {
                    delivery_tag,
                    body: body.to_vec(),
                    reply_to: reply_to.clone(),
                });
            }
        }
        Ok(())
    }

    fn remove_queue(&mut self, name: &str) {
        self.queues.remove(name);
        for bound in self.exchanges.values_mut() {
            bound.retain(|queue| queue != name);
        }
    }

    fn drop_connection(&mut self, id: u64) {
        self.connections.remove(&id);
        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.remove_queue(&name);
        }
        for queue in self.queues.values_mut() {
            queue.subscribers.retain(|s| s.connection != id);
        }
    }

    fn drop_channel(&mut self, id: u64) {
        for queue in self.queues.values_mut() {
            queue.subscribers.retain(|s| s.channel != id);
        }
    }
}

/// In-process broker. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `count` dials fail with `error`.
    pub fn fail_next_dials(&self, count: usize, error: RawTransportError) {
        let mut state = self.lock();
        state.failures.extend(std::iter::repeat(error).take(count));
    }

    /// Every dial fails with `error` until [`set_up`](Self::set_up).
    pub fn set_down(&self, error: RawTransportError) {
        self.lock().down = Some(error);
    }

    pub fn set_up(&self) {
        self.lock().down = None;
    }

    /// Drops every live connection, the way a broker restart would.
    pub fn disconnect_all(&self, error: Option<RawTransportError>) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            if let Some(signal) = state.connections.get(&id) {
                signal.send_replace(Some(error.clone()));
            }
            state.drop_connection(id);
        }
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats.clone()
    }

    pub fn live_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.subscribers.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn bound_queues(&self, exchange: &str) -> Vec<String> {
        self.lock()
            .exchanges
            .get(exchange)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self, _url: &str) -> Result<MemoryConnection, RawTransportError> {
        let mut state = self.lock();
        state.stats.dials += 1;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }
        if let Some(error) = &state.down {
            return Err(error.clone());
        }

        let id = state.next_id();
        let (signal, _) = watch::channel(None);
        let signal = Arc::new(signal);
        state.connections.insert(id, Arc::clone(&signal));
        state.stats.connections_opened += 1;

        Ok(MemoryConnection {
            id,
            broker: self.clone(),
            signal,
        })
    }
}

pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    signal: Arc<CloseSignal>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.signal.borrow().is_none()
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn create_channel(&self) -> Result<MemoryChannel, MessagingError> {
        if !self.is_open() {
            return Err(MessagingError::Channel("connection is closed".into()));
        }
        let mut state = self.broker.lock();
        let id = state.next_id();
        state.stats.channels_opened += 1;
        Ok(MemoryChannel {
            id,
            connection: self.id,
            broker: self.broker.clone(),
            signal: Arc::clone(&self.signal),
            open: AtomicBool::new(true),
        })
    }

    async fn close(&self) -> Result<(), MessagingError> {
        let closed_now = self.signal.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(None);
                true
            } else {
                false
            }
        });
        if closed_now {
            self.broker.lock().drop_connection(self.id);
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

pub struct MemoryChannel {
    id: u64,
    connection: u64,
    broker: MemoryBroker,
    signal: Arc<CloseSignal>,
    open: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), MessagingError> {
        if self.open.load(Ordering::SeqCst) && self.signal.borrow().is_none() {
            Ok(())
        } else {
            Err(MessagingError::Channel("channel is closed".into()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, MessagingError> {
        self.ensure_open()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };
        let owner = options.exclusive.then_some(self.connection);
        self.broker
            .lock()
            .queues
            .entry(name.clone())
            .or_insert_with(|| Queue::new(owner));
        Ok(name)
    }

    async fn assert_exchange(
        &self,
        name: &str,
        _kind: ExchangeKind,
        _options: ExchangeOptions,
    ) -> Result<(), MessagingError> {
        self.ensure_open()?;
        self.broker
            .lock()
            .exchanges
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        _routing_key: &str,
    ) -> Result<(), MessagingError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::Declare(format!("NOT_FOUND - no queue '{queue}'")));
        }
        let bound = state.exchanges.get_mut(exchange).ok_or_else(|| {
            MessagingError::Declare(format!("NOT_FOUND - no exchange '{exchange}'"))
        })?;
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<(), MessagingError> {
        self.ensure_open()?;
        self.broker.lock().stats.prefetch.push(count);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<(), MessagingError> {
        self.ensure_open()?;
        self.broker
            .lock()
            .route(exchange, routing_key, payload, properties.reply_to)
    }

    async fn consume(
        &self,
        queue: &str,
        _options: ConsumeOptions,
    ) -> Result<Consumer, MessagingError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let tag = format!("ctag-{}", state.next_id());
        let target = state.queues.get_mut(queue).ok_or_else(|| {
            MessagingError::Subscribe(format!("NOT_FOUND - no queue '{queue}'"))
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        target.subscribers.push(Subscriber {
            tag: tag.clone(),
            connection: self.connection,
            channel: self.id,
            tx,
        });
        for delivery in mem::take(&mut target.backlog) {
            target.push(delivery);
        }

        let deliveries = stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed();
        Ok(Consumer { tag, deliveries })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.ensure_open()?;
        self.broker.lock().stats.acks.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.ensure_open()?;
        self.broker.lock().stats.nacks.push(delivery_tag);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        for queue in state.queues.values_mut() {
            queue.subscribers.retain(|s| s.tag != consumer_tag);
        }
        state.stats.cancelled.push(consumer_tag.to_string());
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), MessagingError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        state.remove_queue(name);
        state.stats.deleted_queues.push(name.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut state = self.broker.lock();
            state.stats.channels_closed += 1;
            state.drop_channel(self.id);
        }
        Ok(())
    }
}

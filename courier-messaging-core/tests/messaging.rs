mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{eventually, messenger, messenger_with, Reply};
use courier_messaging_core::{
    testing::MemoryBroker, BrokerChannel, CallOptions, ConnectionEvent, MessagingError, Options,
    PublishProperties, QueueOptions, RequestHandler,
};
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Sum {
    b: i64,
}

/// Replies with a fixed value after an optional delay.
struct Fixed {
    reply: Value,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl Fixed {
    fn new(reply: Value) -> Self {
        Self {
            reply,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl RequestHandler for Fixed {
    async fn handle(&self, _request: Value) -> Result<Option<Value>, MessagingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(Some(self.reply.clone()))
    }
}

fn forward(tx: mpsc::UnboundedSender<Value>) -> impl Fn(Value) -> futures_util::future::Ready<Reply> {
    move |request: Value| {
        let _ = tx.send(request);
        futures_util::future::ready(Reply::Ok(None))
    }
}

#[tokio::test]
async fn rpc_round_trip_across_two_consumers() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);
    let seen = Arc::new(AtomicUsize::new(0));

    let mut subscriptions = Vec::new();
    for _ in 0..2 {
        let seen = Arc::clone(&seen);
        let handler = move |request: Value| {
            let seen = Arc::clone(&seen);
            async move {
                assert_eq!(request, json!({ "a": 1 }));
                tokio::time::sleep(Duration::from_millis(100)).await;
                seen.fetch_add(1, Ordering::SeqCst);
                Reply::Ok(Some(json!({ "b": 2 })))
            }
        };
        subscriptions.push(
            messenger
                .on_queue("test-queue", CallOptions::new().ack(true), handler)
                .await
                .unwrap(),
        );
    }
    assert_eq!(broker.consumer_count("test-queue"), 2);

    let request = json!({ "a": 1 });
    let (first, second) = tokio::join!(
        messenger.queue_rpc::<_, Sum>("test-queue", CallOptions::new(), &request),
        messenger.queue_rpc::<_, Sum>("test-queue", CallOptions::new(), &request),
    );
    assert_eq!(first.unwrap(), Sum { b: 2 });
    assert_eq!(second.unwrap(), Sum { b: 2 });
    assert_eq!(seen.load(Ordering::SeqCst), 2);

    eventually(|| broker.stats().acks.len() == 2).await;
    let stats = broker.stats();
    assert_eq!(stats.prefetch, vec![1, 1]);
    assert_eq!(stats.deleted_queues.len(), 2);
    assert!(stats.nacks.is_empty());
    assert!(subscriptions.iter().all(|s| s.is_active()));
}

#[tokio::test]
async fn fire_and_forget_queue() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _subscription = messenger
        .on_queue("jobs", CallOptions::new(), forward(tx))
        .await
        .unwrap();
    messenger
        .queue("jobs", CallOptions::new(), &json!({ "job": "resize" }))
        .await
        .unwrap();

    assert_eq!(rx.recv().await, Some(json!({ "job": "resize" })));
    // auto-ack consumers are never settled explicitly
    let stats = broker.stats();
    assert!(stats.acks.is_empty());
    assert!(stats.nacks.is_empty());
}

#[tokio::test]
async fn queued_requests_wait_for_a_consumer() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);

    messenger
        .queue("later", CallOptions::new(), &json!({ "n": 1 }))
        .await
        .unwrap();
    assert!(broker.has_queue("later"));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = messenger
        .on_queue("later", CallOptions::new(), forward(tx))
        .await
        .unwrap();
    assert_eq!(rx.recv().await, Some(json!({ "n": 1 })));
}

#[tokio::test]
async fn manual_ack_without_reply_is_acked() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _subscription = messenger
        .on_queue("audit", CallOptions::new().ack(true).prefetch(10), forward(tx))
        .await
        .unwrap();
    messenger
        .queue("audit", CallOptions::new(), &json!({ "event": "login" }))
        .await
        .unwrap();

    assert_eq!(rx.recv().await, Some(json!({ "event": "login" })));
    eventually(|| broker.stats().acks.len() == 1).await;
    assert_eq!(broker.stats().prefetch, vec![10]);
}

#[tokio::test]
async fn failing_handlers_do_not_stop_the_consumer() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handler = move |request: Value| {
        let tx = tx.clone();
        async move {
            match request["mode"].as_str() {
                Some("panic") => panic!("handler blew up"),
                Some("fail") => Err(MessagingError::Handler("bad request".into())),
                _ => {
                    let _ = tx.send(request);
                    Reply::Ok(None)
                }
            }
        }
    };
    let subscription = messenger
        .on_queue("fragile", CallOptions::new().ack(true), handler)
        .await
        .unwrap();

    for mode in ["panic", "fail", "ok"] {
        messenger
            .queue("fragile", CallOptions::new(), &json!({ "mode": mode }))
            .await
            .unwrap();
    }

    assert_eq!(rx.recv().await, Some(json!({ "mode": "ok" })));
    eventually(|| {
        let stats = broker.stats();
        stats.nacks.len() == 2 && stats.acks.len() == 1
    })
    .await;
    assert!(subscription.is_active());
}

#[tokio::test]
async fn undecodable_payload_is_rejected() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _subscription = messenger
        .on_queue("strict", CallOptions::new().ack(true), forward(tx))
        .await
        .unwrap();

    let channel = messenger.manager().channel().await.unwrap();
    channel
        .send_to_queue("strict", b"not json", PublishProperties::default())
        .await
        .unwrap();
    messenger
        .queue("strict", CallOptions::new(), &json!({ "valid": true }))
        .await
        .unwrap();

    assert_eq!(rx.recv().await, Some(json!({ "valid": true })));
    eventually(|| broker.stats().nacks.len() == 1).await;
}

#[tokio::test(start_paused = true)]
async fn rpc_times_out_when_configured() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);

    let result = messenger
        .queue_rpc::<_, Value>("nobody-home", CallOptions::new().timeout_ms(250), &json!({}))
        .await;

    assert!(matches!(result, Err(MessagingError::Timeout(250))));
    let stats = broker.stats();
    assert_eq!(stats.deleted_queues.len(), 1);
    assert_eq!(stats.channels_closed, 1);
}

#[tokio::test]
async fn rpc_reply_that_does_not_match_the_type_is_an_error() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);
    let _subscription = messenger
        .on_queue("shape", CallOptions::new(), Fixed::new(json!("plain string")))
        .await
        .unwrap();

    let result = messenger
        .queue_rpc::<_, Sum>("shape", CallOptions::new(), &json!({}))
        .await;
    assert!(matches!(result, Err(MessagingError::Serialization(_))));
}

#[tokio::test]
async fn broadcast_collects_until_max() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);

    let mut subscriptions = Vec::new();
    for _ in 0..2 {
        subscriptions.push(
            messenger
                .on_broadcast("test-exchange", Fixed::new(json!({ "b": 2 })))
                .await
                .unwrap(),
        );
    }
    assert_eq!(broker.bound_queues("test-exchange").len(), 2);

    let started = tokio::time::Instant::now();
    let replies = messenger
        .broadcast_collect(
            "test-exchange",
            CallOptions::new().max(2).timeout_ms(10_000),
            &json!({ "a": 1 }),
        )
        .await
        .unwrap();

    assert_eq!(replies, vec![json!({ "b": 2 }), json!({ "b": 2 })]);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn collection_is_finalized_once() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);

    let slow = Fixed::new(json!({ "from": "slow" })).delayed(Duration::from_millis(200));
    let slow_calls = Arc::clone(&slow.calls);
    let _subscriptions = vec![
        messenger
            .on_broadcast("census", Fixed::new(json!({ "from": "fast" })))
            .await
            .unwrap(),
        messenger
            .on_broadcast("census", Fixed::new(json!({ "from": "fast" })))
            .await
            .unwrap(),
        messenger.on_broadcast("census", slow).await.unwrap(),
    ];

    let replies = messenger
        .broadcast_collect("census", CallOptions::new().max(2), &json!({}))
        .await
        .unwrap();
    assert_eq!(replies.len(), 2);

    // the slow reply lands after the reply queue is gone
    eventually(|| slow_calls.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stats = broker.stats();
    assert_eq!(stats.cancelled.len(), 1);
    assert_eq!(stats.deleted_queues.len(), 1);
    assert_eq!(broker.bound_queues("census").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn collection_stops_at_the_deadline() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);
    let _subscription = messenger
        .on_broadcast("sparse", Fixed::new(json!({ "here": true })))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let replies = messenger
        .broadcast_collect("sparse", CallOptions::new().max(3), &json!({}))
        .await
        .unwrap();

    assert_eq!(replies, vec![json!({ "here": true })]);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(5000));
    assert!(elapsed < Duration::from_millis(5100));
    assert_eq!(broker.stats().deleted_queues.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn collection_without_subscribers_is_empty() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);

    let replies = messenger
        .broadcast_collect("silent", CallOptions::new().timeout_ms(50), &json!({}))
        .await
        .unwrap();
    assert!(replies.is_empty());
}

#[tokio::test]
async fn broadcast_reaches_every_subscriber() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _a = messenger
        .on_broadcast("news", forward(tx.clone()))
        .await
        .unwrap();
    let _b = messenger.on_broadcast("news", forward(tx)).await.unwrap();

    messenger
        .broadcast("news", CallOptions::new(), &json!({ "headline": "up" }))
        .await
        .unwrap();

    assert_eq!(rx.recv().await, Some(json!({ "headline": "up" })));
    assert_eq!(rx.recv().await, Some(json!({ "headline": "up" })));
}

#[tokio::test]
async fn cancelled_subscription_stops_consuming() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);
    let (tx, _rx) = mpsc::unbounded_channel();

    let subscription = messenger
        .on_queue("short-lived", CallOptions::new(), forward(tx))
        .await
        .unwrap();
    assert_eq!(broker.consumer_count("short-lived"), 1);

    subscription.cancel().await;

    assert_eq!(broker.consumer_count("short-lived"), 0);
    assert_eq!(broker.stats().cancelled.len(), 1);
}

#[tokio::test]
async fn consumers_reattach_after_reconnect() {
    let broker = MemoryBroker::new();
    let messenger = messenger_with(
        &broker,
        Options::default()
            .with_retry_on_error(true)
            .with_backoff(vec![10]),
    );
    let mut events = messenger.manager().subscribe();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscription = messenger
        .on_queue("durable-jobs", CallOptions::new(), forward(tx))
        .await
        .unwrap();

    broker.disconnect_all(None);
    common::next_event(&mut events, |e| *e == ConnectionEvent::Disconnected).await;
    eventually(|| broker.consumer_count("durable-jobs") == 1).await;

    messenger
        .queue("durable-jobs", CallOptions::new(), &json!({ "after": "reconnect" }))
        .await
        .unwrap();
    assert_eq!(rx.recv().await, Some(json!({ "after": "reconnect" })));
    assert!(subscription.is_active());
    assert_eq!(broker.stats().connections_opened, 2);
}

#[tokio::test]
async fn consumers_stop_after_reconnect_without_retry() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);
    let (tx, _rx) = mpsc::unbounded_channel();

    let subscription = messenger
        .on_queue("fragile-jobs", CallOptions::new(), forward(tx))
        .await
        .unwrap();
    broker.disconnect_all(None);

    eventually(|| !subscription.is_active()).await;
}

#[tokio::test]
async fn operations_fail_once_closed() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);
    messenger.close().await;

    let queued = messenger.queue("q", CallOptions::new(), &json!({})).await;
    assert!(matches!(queued, Err(MessagingError::Closed)));

    let collected = messenger
        .broadcast_collect("x", CallOptions::new(), &json!({}))
        .await;
    assert!(matches!(collected, Err(MessagingError::Closed)));

    let (tx, _rx) = mpsc::unbounded_channel();
    let subscribed = messenger.on_queue("q", CallOptions::new(), forward(tx)).await;
    assert!(matches!(subscribed, Err(MessagingError::Closed)));
}

#[tokio::test]
async fn call_options_leave_facade_options_untouched() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);
    let _subscription = messenger
        .on_queue("tuned", CallOptions::new().ack(true).prefetch(5), Fixed::new(json!(1)))
        .await
        .unwrap();

    assert!(!messenger.options().ack);
    assert_eq!(messenger.options().prefetch, None);

    let queue = messenger
        .manager()
        .channel()
        .await
        .unwrap()
        .assert_queue("tuned", QueueOptions::default())
        .await
        .unwrap();
    assert_eq!(queue, "tuned");
}

#[tokio::test]
async fn ended_consumer_closes_its_channel() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);
    let (tx, _rx) = mpsc::unbounded_channel();

    let subscription = messenger
        .on_queue("doomed", CallOptions::new(), forward(tx))
        .await
        .unwrap();

    let admin = messenger.manager().channel().await.unwrap();
    admin.delete_queue("doomed").await.unwrap();

    eventually(|| !subscription.is_active()).await;
    let stats = broker.stats();
    assert_eq!(stats.channels_opened, 2);
    assert_eq!(stats.channels_closed, 1);
}

#[tokio::test]
async fn reattached_consumer_closes_the_old_channel() {
    let broker = MemoryBroker::new();
    let messenger = messenger_with(
        &broker,
        Options::default()
            .with_retry_on_error(true)
            .with_backoff(vec![10]),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscription = messenger
        .on_queue("recreated", CallOptions::new(), forward(tx))
        .await
        .unwrap();

    let admin = messenger.manager().channel().await.unwrap();
    admin.delete_queue("recreated").await.unwrap();

    eventually(|| broker.consumer_count("recreated") == 1).await;
    let stats = broker.stats();
    assert_eq!(stats.channels_opened, 3);
    assert_eq!(stats.channels_closed, 1);

    messenger
        .queue("recreated", CallOptions::new(), &json!({ "still": "here" }))
        .await
        .unwrap();
    assert_eq!(rx.recv().await, Some(json!({ "still": "here" })));
    assert!(subscription.is_active());
}

#[tokio::test]
async fn auto_ack_failures_are_never_settled() {
    let broker = MemoryBroker::new();
    let messenger = messenger(&broker);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handler = move |request: Value| {
        let tx = tx.clone();
        async move {
            if request["fail"] == json!(true) {
                return Err(MessagingError::Handler("rejected".into()));
            }
            let _ = tx.send(request);
            Reply::Ok(None)
        }
    };
    let _subscription = messenger
        .on_queue("lenient", CallOptions::new(), handler)
        .await
        .unwrap();

    for fail in [true, false] {
        messenger
            .queue("lenient", CallOptions::new(), &json!({ "fail": fail }))
            .await
            .unwrap();
    }

    assert_eq!(rx.recv().await, Some(json!({ "fail": false })));
    let stats = broker.stats();
    assert!(stats.acks.is_empty());
    assert!(stats.nacks.is_empty());
}

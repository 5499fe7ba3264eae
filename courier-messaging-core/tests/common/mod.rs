#![allow(dead_code)]

use std::time::Duration;

use courier_messaging_core::{
    testing::MemoryBroker, ConnectionEvent, MessagingError, Messenger, Options, Settings,
};
use serde_json::Value;
use tokio::sync::broadcast;

pub type Reply = Result<Option<Value>, MessagingError>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn settings() -> Settings {
    Settings {
        user: String::new(),
        password: String::new(),
        host: "memory".into(),
        vhost: String::new(),
    }
}

pub fn messenger(broker: &MemoryBroker) -> Messenger<MemoryBroker> {
    messenger_with(broker, Options::default())
}

pub fn messenger_with(broker: &MemoryBroker, options: Options) -> Messenger<MemoryBroker> {
    init_tracing();
    Messenger::new(broker.clone(), settings(), options)
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Waits for the first event matching `wanted`.
pub async fn next_event(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    wanted: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("event not seen in time")
}

mod channel;
mod client;
mod protocol;
mod server;
mod service;

pub use channel::{State, SyncChannel, Topic};
pub use client::HttpSyncClient;
pub use server::router;
pub use service::SyncService;

use std::{marker::PhantomData, time::Duration};

use anyhow::{anyhow, Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle, time::timeout};

/// How long the HTTP service holds a subscribe or barrier request open before
/// answering with "nothing yet". Client timeouts must exceed it.
pub const POLL_INTERVAL_SECS: u64 = 20;

/// The coordination service as seen by one participant.
#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<u64>;

    /// Every value of the topic, past and future, in publish order.
    async fn subscribe(&self, topic: &str) -> Result<Subscription<Value>>;

    async fn signal_entry(&self, state: &str) -> Result<u64>;

    /// Blocks until `state` has been signalled `target` times.
    async fn barrier(&self, state: &str, target: u64) -> Result<u64>;

    async fn signal_and_wait(&self, state: &str, target: u64) -> Result<u64> {
        self.signal_entry(state).await?;
        self.barrier(state, target).await
    }
}

pub struct Subscription<T> {
    topic: String,
    rx: UnboundedReceiver<Value>,
    poller: Option<AbortOnDrop>,
    timeout: Option<Duration>,
    _marker: PhantomData<fn() -> T>,
}

struct AbortOnDrop(JoinHandle<Result<()>>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Subscription<T> {
    /// `poller` feeds `rx` from elsewhere; its error, if any, is what `next`
    /// reports once `rx` runs dry.
    pub fn new(topic: &str, rx: UnboundedReceiver<Value>, poller: Option<JoinHandle<Result<()>>>) -> Self {
        Self {
            topic: topic.to_string(),
            rx,
            poller: poller.map(AbortOnDrop),
            timeout: None,
            _marker: PhantomData,
        }
    }

    /// Makes `next` fail when no value arrives within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cast<U>(self) -> Subscription<U> {
        Subscription {
            topic: self.topic,
            rx: self.rx,
            poller: self.poller,
            timeout: self.timeout,
            _marker: PhantomData,
        }
    }

    /// Ends the subscription. Dropping it has the same effect.
    pub fn done(self) {}

    async fn closed(&mut self) -> Error {
        if let Some(mut poller) = self.poller.take() {
            if let Ok(Err(e)) = (&mut poller.0).await {
                return e.context(format!("subscription to {} failed", self.topic));
            }
        }

        anyhow!("subscription to {} closed", self.topic)
    }
}

impl<T: DeserializeOwned> Subscription<T> {
    pub async fn next(&mut self) -> Result<T> {
        let received = match self.timeout {
            Some(limit) => timeout(limit, self.rx.recv())
                .await
                .map_err(|_| anyhow!("timed out after {limit:?} waiting on topic {}", self.topic))?,
            None => self.rx.recv().await,
        };

        let value = match received {
            Some(value) => value,
            None => return Err(self.closed().await),
        };

        Ok(serde_json::from_value(value)?)
    }
}

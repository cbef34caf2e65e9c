use std::{borrow::Cow, future::Future, marker::PhantomData, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use log::debug;
use serde::Serialize;
use tokio::time::timeout;

use crate::sync::{Subscription, SyncClient};

pub struct Topic<T> {
    name: Cow<'static, str>,
    _marker: PhantomData<fn() -> T>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct State(Cow<'static, str>);

impl<T> Topic<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            _marker: PhantomData,
        }
    }

    pub fn owned(name: String) -> Self {
        Self {
            name: Cow::Owned(name),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl State {
    pub const fn new(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn owned(name: String) -> Self {
        Self(Cow::Owned(name))
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

/// A coordination client scoped to one run: every topic and state name is
/// prefixed with the run id so a shared service can host several runs.
#[derive(Clone)]
pub struct SyncChannel {
    client: Arc<dyn SyncClient>,
    run_id: String,
    timeout: Option<Duration>,
}

impl SyncChannel {
    pub fn new(client: Arc<dyn SyncClient>, run_id: &str) -> Self {
        Self {
            client,
            run_id: run_id.to_string(),
            timeout: None,
        }
    }

    /// Bounds every barrier and every subscription read. A rendezvous that
    /// does not complete within `timeout` is an error.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn topic_key<T>(&self, topic: &Topic<T>) -> String {
        format!("run:{}:topic:{}", self.run_id, topic.name())
    }

    fn state_key(&self, state: &State) -> String {
        format!("run:{}:state:{}", self.run_id, state.name())
    }

    async fn bounded<F>(&self, state: &State, target: u64, wait: F) -> Result<u64>
    where
        F: Future<Output = Result<u64>>,
    {
        match self.timeout {
            Some(limit) => timeout(limit, wait).await.map_err(|_| {
                anyhow!("timed out after {limit:?} waiting for {target} instance(s) on state {}", state.name())
            })?,
            None => wait.await,
        }
    }

    pub async fn publish<T: Serialize>(&self, topic: &Topic<T>, value: &T) -> Result<u64> {
        let payload = serde_json::to_value(value)?;
        let seq = self.client.publish(&self.topic_key(topic), payload).await?;
        debug!("Published entry {seq} on topic {}. ", topic.name());
        Ok(seq)
    }

    pub async fn subscribe<T>(&self, topic: &Topic<T>) -> Result<Subscription<T>> {
        let subscription = self.client.subscribe(&self.topic_key(topic)).await?;

        Ok(match self.timeout {
            Some(limit) => subscription.with_timeout(limit).cast(),
            None => subscription.cast(),
        })
    }

    pub async fn signal_entry(&self, state: &State) -> Result<u64> {
        let seq = self.client.signal_entry(&self.state_key(state)).await?;
        debug!("Signalled state {} ({seq}). ", state.name());
        Ok(seq)
    }

    pub async fn barrier(&self, state: &State, target: u64) -> Result<u64> {
        debug!("Waiting for {target} instance(s) on state {}. ", state.name());
        let key = self.state_key(state);
        self.bounded(state, target, self.client.barrier(&key, target)).await
    }

    pub async fn signal_and_wait(&self, state: &State, target: u64) -> Result<u64> {
        debug!("Signalling and waiting for {target} instance(s) on state {}. ", state.name());
        let key = self.state_key(state);
        self.bounded(state, target, self.client.signal_and_wait(&key, target)).await
    }
}

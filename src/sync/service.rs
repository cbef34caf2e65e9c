use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot::{self, Sender},
};

use crate::sync::{Subscription, SyncClient};

pub enum Command {
    Publish(String, Value, Sender<u64>),
    Subscribe(String, u64, UnboundedSender<Value>),
    Signal(String, Sender<u64>),
    Wait(String, u64, Sender<u64>),
    Count(String, Sender<u64>),
}

#[derive(Default)]
struct TopicLog {
    values: Vec<Value>,
    subscribers: Vec<UnboundedSender<Value>>,
}

#[derive(Default)]
struct Barrier {
    count: u64,
    waiters: Vec<(u64, Sender<u64>)>,
}

/// Barriers and topics shared by every participant of a run. The state is
/// owned by a single actor task; this handle only carries its command queue.
#[derive(Clone)]
pub struct SyncService {
    command_tx: UnboundedSender<Command>,
}

impl SyncService {
    pub fn spawn() -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::start(command_rx));
        Self { command_tx }
    }

    async fn start(mut command_rx: UnboundedReceiver<Command>) -> Result<()> {
        let mut topics: HashMap<String, TopicLog> = HashMap::new();
        let mut barriers: HashMap<String, Barrier> = HashMap::new();

        while let Some(command) = command_rx.recv().await {
            match command {
                Command::Publish(topic, value, tx) => publish_impl(&mut topics, topic, value, tx),
                Command::Subscribe(topic, cursor, tx) => subscribe_impl(&mut topics, topic, cursor, tx),
                Command::Signal(state, tx) => signal_impl(&mut barriers, state, tx),
                Command::Wait(state, target, tx) => wait_impl(&mut barriers, state, target, tx),
                Command::Count(state, tx) => count_impl(&barriers, state, tx),
            }
        }

        debug!("Sync service command queue closed. ");
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| anyhow!("sync service is shut down"))
    }

    pub async fn publish_value(&self, topic: &str, value: Value) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Publish(topic.to_string(), value, tx))?;
        Ok(rx.await?)
    }

    /// Streams every value of `topic` from position `cursor` on, then every
    /// value published afterwards.
    pub fn subscribe_from(&self, topic: &str, cursor: u64) -> Result<UnboundedReceiver<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(Command::Subscribe(topic.to_string(), cursor, tx))?;
        Ok(rx)
    }

    pub async fn signal(&self, state: &str) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Signal(state.to_string(), tx))?;
        Ok(rx.await?)
    }

    pub async fn wait(&self, state: &str, target: u64) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Wait(state.to_string(), target, tx))?;
        rx.await.map_err(|_| anyhow!("sync service dropped barrier {state}"))
    }

    pub async fn count(&self, state: &str) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Count(state.to_string(), tx))?;
        Ok(rx.await?)
    }
}

#[async_trait]
impl SyncClient for SyncService {
    async fn publish(&self, topic: &str, payload: Value) -> Result<u64> {
        self.publish_value(topic, payload).await
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription<Value>> {
        let rx = self.subscribe_from(topic, 0)?;
        Ok(Subscription::new(topic, rx, None))
    }

    async fn signal_entry(&self, state: &str) -> Result<u64> {
        self.signal(state).await
    }

    async fn barrier(&self, state: &str, target: u64) -> Result<u64> {
        self.wait(state, target).await
    }
}

fn publish_impl(topics: &mut HashMap<String, TopicLog>, topic: String, value: Value, tx: Sender<u64>) {
    let log = topics.entry(topic).or_default();

    log.subscribers.retain(|subscriber| subscriber.send(value.clone()).is_ok());
    log.values.push(value);

    let seq = log.values.len() as u64;
    if tx.send(seq).is_err() {
        debug!("Publisher went away before receiving sequence {seq}. ");
    }
}

fn subscribe_impl(
    topics: &mut HashMap<String, TopicLog>,
    topic: String,
    cursor: u64,
    tx: UnboundedSender<Value>,
) {
    let log = topics.entry(topic).or_default();

    for value in log.values.iter().skip(cursor as usize) {
        if tx.send(value.clone()).is_err() {
            return;
        }
    }

    // long polls leave a closed sender behind each time they time out
    log.subscribers.retain(|subscriber| !subscriber.is_closed());
    log.subscribers.push(tx);
}

fn signal_impl(barriers: &mut HashMap<String, Barrier>, state: String, tx: Sender<u64>) {
    let barrier = barriers.entry(state).or_default();
    barrier.count += 1;

    let count = barrier.count;
    let (released, waiting): (Vec<_>, Vec<_>) = barrier
        .waiters
        .drain(..)
        .partition(|(target, _)| *target <= count);
    barrier.waiters = waiting;

    for (_, waiter) in released {
        // a waiter whose caller gave up is simply forgotten
        let _ = waiter.send(count);
    }

    if tx.send(count).is_err() {
        debug!("Signaller went away before receiving count {count}. ");
    }
}

fn wait_impl(barriers: &mut HashMap<String, Barrier>, state: String, target: u64, tx: Sender<u64>) {
    let barrier = barriers.entry(state).or_default();

    if barrier.count >= target {
        let _ = tx.send(barrier.count);
        return;
    }

    barrier.waiters.retain(|(_, waiter)| !waiter.is_closed());
    barrier.waiters.push((target, tx));
}

fn count_impl(barriers: &HashMap<String, Barrier>, state: String, tx: Sender<u64>) {
    let count = barriers.get(&state).map(|barrier| barrier.count).unwrap_or(0);
    let _ = tx.send(count);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::time::timeout;

    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn publish_returns_sequence_numbers() {
        let service = SyncService::spawn();
        assert_eq!(service.publish_value("t", json!(1)).await.unwrap(), 1);
        assert_eq!(service.publish_value("t", json!(2)).await.unwrap(), 2);
        assert_eq!(service.publish_value("other", json!(3)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn late_subscriber_replays_history_then_follows() {
        let service = SyncService::spawn();
        service.publish_value("t", json!("a")).await.unwrap();
        service.publish_value("t", json!("b")).await.unwrap();

        let mut rx = service.subscribe_from("t", 0).unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!("a"));
        assert_eq!(rx.recv().await.unwrap(), json!("b"));

        service.publish_value("t", json!("c")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!("c"));
        assert!(timeout(SHORT, rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn cursor_skips_seen_values() {
        let service = SyncService::spawn();
        for i in 0..4 {
            service.publish_value("t", json!(i)).await.unwrap();
        }

        let mut rx = service.subscribe_from("t", 3).unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!(3));
        assert!(timeout(SHORT, rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn closed_subscribers_are_dropped() {
        let service = SyncService::spawn();
        let rx = service.subscribe_from("t", 0).unwrap();
        drop(rx);

        service.publish_value("t", json!(1)).await.unwrap();
        let mut rx = service.subscribe_from("t", 0).unwrap();
        assert_eq!(rx.recv().await.unwrap(), json!(1));
    }

    #[test]
    fn idle_topic_forgets_abandoned_subscribers() {
        let mut topics = HashMap::new();

        for _ in 0..3 {
            let (tx, rx) = mpsc::unbounded_channel();
            subscribe_impl(&mut topics, "idle".into(), 0, tx);
            drop(rx);
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        subscribe_impl(&mut topics, "idle".into(), 0, tx);

        assert_eq!(topics["idle"].subscribers.len(), 1);
    }

    #[tokio::test]
    async fn barrier_releases_all_waiters_at_target() {
        let service = SyncService::spawn();

        let first = {
            let service = service.clone();
            tokio::spawn(async move {
                service.signal("ready").await.unwrap();
                service.wait("ready", 3).await.unwrap()
            })
        };
        let second = {
            let service = service.clone();
            tokio::spawn(async move {
                service.signal("ready").await.unwrap();
                service.wait("ready", 3).await.unwrap()
            })
        };

        tokio::time::sleep(SHORT).await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());
        assert_eq!(service.count("ready").await.unwrap(), 2);

        assert_eq!(service.signal("ready").await.unwrap(), 3);
        assert_eq!(first.await.unwrap(), 3);
        assert_eq!(second.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn wait_on_reached_barrier_returns_immediately() {
        let service = SyncService::spawn();
        service.signal("done").await.unwrap();
        assert_eq!(service.wait("done", 1).await.unwrap(), 1);
        assert_eq!(service.wait("done", 0).await.unwrap(), 1);
        assert_eq!(service.count("unknown").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn signal_and_wait_through_client_trait() {
        let service = SyncService::spawn();
        let client: &dyn SyncClient = &service;

        assert_eq!(client.signal_and_wait("solo", 1).await.unwrap(), 1);
        assert_eq!(client.signal_entry("solo").await.unwrap(), 2);
    }
}

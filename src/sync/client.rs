use std::{net::SocketAddr, time::Duration};

use anyhow::{anyhow, Error, Result};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{
    sync::mpsc::{self, UnboundedSender},
    time::timeout,
};

use crate::sync::{protocol::*, Subscription, SyncClient};

/// Talks to a remote coordination service started with `blockbench serve`.
pub struct HttpSyncClient {
    client: Client,
    addr: SocketAddr,
    barrier_timeout: Duration,
}

impl HttpSyncClient {
    pub fn new(addr: SocketAddr, request_timeout: Duration, barrier_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            addr,
            barrier_timeout,
        })
    }

    fn uri(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

#[async_trait]
impl SyncClient for HttpSyncClient {
    async fn publish(&self, topic: &str, payload: Value) -> Result<u64> {
        let request = PublishRequest {
            topic: topic.to_string(),
            payload,
        };

        let response: PublishResponse = send_json(
            self.client.post(self.uri("/sync/publish")).json(&request),
        ).await?;

        Ok(response.seq)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let client = self.client.clone();
        let uri = self.uri("/sync/subscribe");
        let name = topic.to_string();
        let poller = tokio::spawn(async move {
            let result = poll_topic(client, uri, &name, tx).await;
            if let Err(e) = &result {
                warn!("Subscription to topic {name} failed: {e}. ");
            }
            result
        });

        Ok(Subscription::new(topic, rx, Some(poller)))
    }

    async fn signal_entry(&self, state: &str) -> Result<u64> {
        let request = SignalRequest {
            state: state.to_string(),
        };

        let response: SignalResponse = send_json(
            self.client.post(self.uri("/sync/signal")).json(&request),
        ).await?;

        Ok(response.seq)
    }

    async fn barrier(&self, state: &str, target: u64) -> Result<u64> {
        let request = BarrierRequest {
            state: state.to_string(),
            target,
        };

        let wait = async {
            loop {
                let response: BarrierResponse = send_json(
                    self.client.get(self.uri("/sync/barrier")).json(&request),
                ).await?;

                if response.reached {
                    return Ok::<u64, Error>(response.count);
                }

                debug!("State {state} at {}/{target}, still waiting. ", response.count);
            }
        };

        timeout(self.barrier_timeout, wait)
            .await
            .map_err(|_| anyhow!("timed out waiting for {target} instance(s) on state {state}"))?
    }
}

async fn poll_topic(client: Client, uri: String, topic: &str, tx: UnboundedSender<Value>) -> Result<()> {
    let mut cursor = 0;

    loop {
        let request = SubscribeRequest {
            topic: topic.to_string(),
            cursor,
        };

        let response: SubscribeResponse = send_json(client.get(&uri).json(&request)).await?;
        cursor += response.values.len() as u64;

        for value in response.values {
            if tx.send(value).is_err() {
                return Ok(());
            }
        }
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
    let response = request.send().await?;

    if !response.status().is_success() {
        let text = response.text().await?;
        return Err(anyhow!("sync service rejected request: {text}"));
    }

    Ok(response.json().await?)
}

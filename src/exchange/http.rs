use std::{net::SocketAddr, sync::Mutex, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;

use crate::{
    block::{Block, ContentHandle},
    exchange::{
        protocol::{get_peer_block, get_peer_identity},
        Exchange,
    },
    identity::ParticipantIdentity,
};

/// Fetches blocks over HTTP from the peers it has been connected to, asking
/// them one at a time in connection order.
pub struct HttpExchange {
    client: Client,
    peers: Mutex<Vec<(ParticipantIdentity, SocketAddr)>>,
}

impl HttpExchange {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            peers: Mutex::new(vec![]),
        })
    }
}

#[async_trait]
impl Exchange for HttpExchange {
    async fn connect(&self, peer: &ParticipantIdentity) -> Result<()> {
        if peer.addrs.is_empty() {
            return Err(anyhow!("peer {} has no address", peer.name));
        }

        for addr in &peer.addrs {
            let remote = match get_peer_identity(&self.client, addr).await {
                Ok(remote) => remote,
                Err(e) => {
                    warn!("Failed to reach {} at {addr}: {e}. ", peer.name);
                    continue;
                },
            };

            if remote.id != peer.id {
                warn!("Address {addr} answered as {} instead of {}. ", remote.name, peer.name);
                continue;
            }

            let mut peers = self.peers.lock().map_err(|_| anyhow!("failed to acquire lock"))?;
            peers.retain(|(known, _)| known.id != peer.id);
            peers.push((peer.clone(), *addr));

            debug!("Connected to {} via {addr}. ", peer.name);
            return Ok(());
        }

        Err(anyhow!("no address of peer {} is reachable", peer.name))
    }

    async fn get_block(&self, handle: &ContentHandle) -> Result<Block> {
        let peers = self
            .peers
            .lock()
            .map_err(|_| anyhow!("failed to acquire lock"))?
            .clone();

        for (peer, addr) in peers {
            match get_peer_block(&self.client, &addr, handle).await {
                Ok(Some(data)) => {
                    debug!("Peer {} served block {handle}. ", peer.name);
                    return Block::verified(*handle, data);
                },
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to ask {} for block {handle}: {e}. ", peer.name);
                    continue;
                },
            }
        }

        Err(anyhow!("no connected peer has block {handle}"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        block::{random_block, BlockStore, MemoryBlockStore},
        exchange::router,
        server::bind,
    };

    async fn start_peer(name: &str, store: Arc<MemoryBlockStore>) -> ParticipantIdentity {
        let listeners = bind(&["127.0.0.1:0".parse().unwrap()]).unwrap();
        let identity = ParticipantIdentity::new(name.into(), listeners.local_addrs().to_vec());
        tokio::spawn(listeners.serve(router(identity.clone(), store)));
        identity
    }

    #[tokio::test]
    async fn fetches_block_from_connected_provider() {
        let store = Arc::new(MemoryBlockStore::new());
        let block = random_block(1024);
        store.put(block.clone()).unwrap();

        let provider = start_peer("provider-0", store).await;
        let exchange = HttpExchange::new(Duration::from_secs(5)).unwrap();
        exchange.connect(&provider).await.unwrap();

        let fetched = exchange.get_block(&block.handle).await.unwrap();
        assert_eq!(fetched.handle, block.handle);
        assert_eq!(fetched.data, block.data);
    }

    /// Answers every read with an error, so the block route returns 500.
    struct UnreadableStore;

    impl BlockStore for UnreadableStore {
        fn put(&self, _: Block) -> Result<()> {
            Ok(())
        }

        fn get(&self, _: &ContentHandle) -> Result<Option<Block>> {
            Err(anyhow!("disk unreadable"))
        }

        fn has(&self, _: &ContentHandle) -> Result<bool> {
            Ok(false)
        }

        fn len(&self) -> Result<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn failing_peer_does_not_hide_the_next_one() {
        let broken = {
            let listeners = bind(&["127.0.0.1:0".parse().unwrap()]).unwrap();
            let identity = ParticipantIdentity::new("provider-0".into(), listeners.local_addrs().to_vec());
            tokio::spawn(listeners.serve(router(identity.clone(), Arc::new(UnreadableStore))));
            identity
        };

        let store = Arc::new(MemoryBlockStore::new());
        let block = random_block(256);
        store.put(block.clone()).unwrap();
        let healthy = start_peer("provider-1", store).await;

        let exchange = HttpExchange::new(Duration::from_secs(5)).unwrap();
        exchange.connect(&broken).await.unwrap();
        exchange.connect(&healthy).await.unwrap();

        let fetched = exchange.get_block(&block.handle).await.unwrap();
        assert_eq!(fetched.data, block.data);
    }

    #[tokio::test]
    async fn missing_block_is_an_error() {
        let provider = start_peer("provider-0", Arc::new(MemoryBlockStore::new())).await;
        let exchange = HttpExchange::new(Duration::from_secs(5)).unwrap();
        exchange.connect(&provider).await.unwrap();

        let handle = random_block(8).handle;
        let err = exchange.get_block(&handle).await.unwrap_err();
        assert!(err.to_string().contains(&handle.to_string()));
    }

    #[tokio::test]
    async fn connect_rejects_impostor() {
        let real = start_peer("provider-0", Arc::new(MemoryBlockStore::new())).await;
        let impostor = ParticipantIdentity::new("provider-1".into(), real.addrs.clone());

        let exchange = HttpExchange::new(Duration::from_secs(5)).unwrap();
        assert!(exchange.connect(&impostor).await.is_err());
    }

    #[tokio::test]
    async fn connect_without_address_fails() {
        let exchange = HttpExchange::new(Duration::from_secs(5)).unwrap();
        let nowhere = ParticipantIdentity::new("provider-0".into(), vec![]);

        let err = exchange.connect(&nowhere).await.unwrap_err();
        assert!(err.to_string().contains("no address"));
    }
}

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;

use crate::{
    block::{Block, BlockStore, ContentHandle},
    exchange::Exchange,
    identity::{ParticipantIdentity, PeerId},
};

/// Stands in for the transport when a whole cohort runs in one process.
#[derive(Default)]
pub struct MemoryNetwork {
    peers: Mutex<HashMap<PeerId, Arc<dyn BlockStore>>>,
}

pub struct MemoryExchange {
    network: Arc<MemoryNetwork>,
    connected: Mutex<Vec<PeerId>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: PeerId, store: Arc<dyn BlockStore>) -> Result<()> {
        self
            .peers
            .lock()
            .map_err(|_| anyhow!("failed to acquire lock"))?
            .insert(id, store);
        Ok(())
    }

    pub fn store(&self, id: &PeerId) -> Result<Option<Arc<dyn BlockStore>>> {
        let peers = self.peers.lock().map_err(|_| anyhow!("failed to acquire lock"))?;
        Ok(peers.get(id).cloned())
    }
}

impl MemoryExchange {
    pub fn new(network: Arc<MemoryNetwork>) -> Self {
        Self {
            network,
            connected: Mutex::new(vec![]),
        }
    }
}

#[async_trait]
impl Exchange for MemoryExchange {
    async fn connect(&self, peer: &ParticipantIdentity) -> Result<()> {
        if self.network.store(&peer.id)?.is_none() {
            return Err(anyhow!("peer {} is unreachable", peer.name));
        }

        let mut connected = self.connected.lock().map_err(|_| anyhow!("failed to acquire lock"))?;
        if !connected.contains(&peer.id) {
            connected.push(peer.id);
        }

        Ok(())
    }

    async fn get_block(&self, handle: &ContentHandle) -> Result<Block> {
        let connected = self
            .connected
            .lock()
            .map_err(|_| anyhow!("failed to acquire lock"))?
            .clone();

        for id in connected {
            let store = match self.network.store(&id)? {
                Some(store) => store,
                None => continue,
            };

            if let Some(block) = store.get(handle)? {
                debug!("Peer {id} served block {handle}. ");
                return Block::verified(*handle, block.data);
            }
        }

        Err(anyhow!("no connected peer has block {handle}"))
    }
}

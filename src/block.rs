use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
    result,
    str::FromStr,
    sync::Mutex,
};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use data_encoding::HEXLOWER;
use rand::{thread_rng, RngCore};
use ring::digest::{digest, SHA256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const HANDLE_LENGTH: usize = 32;

/// SHA-256 of a block's bytes. Serialized as lowercase hex so it can travel
/// through the coordination service and in URL paths unchanged.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ContentHandle([u8; HANDLE_LENGTH]);

#[derive(Clone, Debug)]
pub struct Block {
    pub handle: ContentHandle,
    pub data: Bytes,
}

pub trait BlockStore: Send + Sync {
    fn put(&self, block: Block) -> Result<()>;
    fn get(&self, handle: &ContentHandle) -> Result<Option<Block>>;
    fn has(&self, handle: &ContentHandle) -> Result<bool>;
    fn len(&self) -> Result<usize>;
}

#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: Mutex<HashMap<ContentHandle, Bytes>>,
}

impl ContentHandle {
    pub fn of(data: &[u8]) -> Self {
        let mut res = [0u8; HANDLE_LENGTH];
        res.copy_from_slice(digest(&SHA256, data).as_ref());
        Self(res)
    }

    pub fn verify(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }
}

impl Display for ContentHandle {
    fn fmt(&self, f: &mut Formatter) -> result::Result<(), std::fmt::Error> {
        write!(f, "{}", HEXLOWER.encode(&self.0))
    }
}

impl FromStr for ContentHandle {
    type Err = anyhow::Error;

    fn from_str(string: &str) -> Result<Self> {
        let decoded = HEXLOWER
            .decode(string.to_ascii_lowercase().as_bytes())
            .map_err(|_| anyhow!("invalid content handle: {string}"))?;

        let res: [u8; HANDLE_LENGTH] = decoded
            .try_into()
            .map_err(|_| anyhow!("invalid content handle: {string}"))?;

        Ok(Self(res))
    }
}

impl Serialize for ContentHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentHandle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> result::Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        string.parse().map_err(serde::de::Error::custom)
    }
}

impl Block {
    pub fn new(data: Bytes) -> Self {
        Self {
            handle: ContentHandle::of(&data),
            data,
        }
    }

    /// Rebuilds a block received from a peer, rejecting bytes that do not
    /// hash to the handle they were requested under.
    pub fn verified(handle: ContentHandle, data: Bytes) -> Result<Self> {
        if !handle.verify(&data) {
            return Err(anyhow!("block data does not match handle {handle}"));
        }

        Ok(Self { handle, data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

pub fn random_block(size: usize) -> Block {
    let mut buf = vec![0u8; size];
    thread_rng().fill_bytes(&mut buf);
    Block::new(Bytes::from(buf))
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryBlockStore {
    fn put(&self, block: Block) -> Result<()> {
        self
            .blocks
            .lock()
            .map_err(|_| anyhow!("failed to acquire lock"))?
            .insert(block.handle, block.data);
        Ok(())
    }

    fn get(&self, handle: &ContentHandle) -> Result<Option<Block>> {
        let data = self
            .blocks
            .lock()
            .map_err(|_| anyhow!("failed to acquire lock"))?
            .get(handle)
            .cloned();

        Ok(data.map(|data| Block { handle: *handle, data }))
    }

    fn has(&self, handle: &ContentHandle) -> Result<bool> {
        let blocks = self.blocks.lock().map_err(|_| anyhow!("failed to acquire lock"))?;
        Ok(blocks.contains_key(handle))
    }

    fn len(&self) -> Result<usize> {
        let blocks = self.blocks.lock().map_err(|_| anyhow!("failed to acquire lock"))?;
        Ok(blocks.len())
    }
}

mod http;
mod memory;
mod protocol;

pub use http::HttpExchange;
pub use memory::{MemoryExchange, MemoryNetwork};
pub use protocol::router;

use anyhow::Result;
use async_trait::async_trait;

use crate::{
    block::{Block, ContentHandle},
    identity::ParticipantIdentity,
};

/// The block-exchange collaborator used by requestors.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn connect(&self, peer: &ParticipantIdentity) -> Result<()>;

    /// Resolves once a connected peer has served the block and its bytes
    /// hashed to `handle`.
    async fn get_block(&self, handle: &ContentHandle) -> Result<Block>;
}

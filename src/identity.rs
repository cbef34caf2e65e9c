use std::{
    fmt::{Display, Formatter},
    net::SocketAddr,
    result,
};

use data_encoding::HEXUPPER;
use ring::digest::{Context, SHA256};
use serde::{Deserialize, Serialize};

pub const PEER_ID_LENGTH: usize = 32;

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PeerId([u8; PEER_ID_LENGTH]);

/// What a provider announces so requestors can reach it.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ParticipantIdentity {
    pub name: String,
    pub id: PeerId,
    pub addrs: Vec<SocketAddr>,
}

impl PeerId {
    pub fn new(data: &[u8]) -> Self {
        let mut context = Context::new(&SHA256);
        context.update(data);
        let digest = context.finish();

        let mut res = [0u8; PEER_ID_LENGTH];
        res.copy_from_slice(digest.as_ref());
        Self(res)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter) -> result::Result<(), std::fmt::Error> {
        write!(f, "{}", HEXUPPER.encode(&self.0))
    }
}

impl ParticipantIdentity {
    /// The id is derived from the participant name and its addresses, so two
    /// participants sharing a name on different hosts stay distinct.
    pub fn new(name: String, addrs: Vec<SocketAddr>) -> Self {
        let mut seed = name.clone();
        seed.push_str(&format!("{addrs:?}"));

        Self {
            id: PeerId::new(seed.as_bytes()),
            name,
            addrs,
        }
    }
}

impl Display for ParticipantIdentity {
    fn fmt(&self, f: &mut Formatter) -> result::Result<(), std::fmt::Error> {
        let addrs: Vec<_> = self.addrs.iter().map(|addr| addr.to_string()).collect();
        write!(f, "{} ({}) [{}]", self.name, self.id, addrs.join(", "))
    }
}

impl PartialEq for ParticipantIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ParticipantIdentity {}

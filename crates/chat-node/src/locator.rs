use crate::error::Result;
use async_trait::async_trait;
use libp2p::PeerId;

/// A DHT lookup result: a peer and its advertised addresses, unparsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddresses {
    pub peer_id: PeerId,
    pub addresses: Vec<String>,
}

impl PeerAddresses {
    pub fn new(peer_id: PeerId, addresses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            peer_id,
            addresses: addresses.into_iter().map(Into::into).collect(),
        }
    }
}

/// Distributed lookup of the peers closest to a target identifier.
#[async_trait]
pub trait PeerLocator: Send + Sync {
    /// Returns at most `k` peers, closest first.
    async fn find_closest_peers(&self, target: &PeerId, k: usize) -> Result<Vec<PeerAddresses>>;
}

use crate::address_book::AddressBook;
use crate::error::{ChatError, Result};
use crate::locator::PeerLocator;
use libp2p::{Multiaddr, PeerId};
use std::sync::Arc;
use tracing::debug;

/// Only the exact target is wanted from the DHT, not its neighbourhood.
pub const CLOSEST_PEERS: usize = 1;

/// Two-tier lookup: the local address book first, the DHT only when the
/// book has nothing for the peer.
#[derive(Clone)]
pub struct PeerResolver {
    address_book: Arc<dyn AddressBook>,
    locator: Arc<dyn PeerLocator>,
}

impl PeerResolver {
    pub fn new(address_book: Arc<dyn AddressBook>, locator: Arc<dyn PeerLocator>) -> Self {
        Self {
            address_book,
            locator,
        }
    }

    /// Returns at least one address for `target` or fails.
    ///
    /// A cached entry wins even if it is stale; reachability is the dialer's
    /// problem.
    pub async fn resolve(&self, target: &PeerId) -> Result<Vec<Multiaddr>> {
        let cached = self.address_book.get(target).await;
        if !cached.is_empty() {
            debug!(peer_id = ?target, count = cached.len(), "resolved from address book");
            return Ok(cached);
        }

        let found = self
            .locator
            .find_closest_peers(target, CLOSEST_PEERS)
            .await?;
        let entry = found
            .into_iter()
            .find(|candidate| &candidate.peer_id == target)
            .ok_or(ChatError::PeerNotFound(*target))?;

        let addresses = entry
            .addresses
            .into_iter()
            .map(|raw| {
                raw.parse::<Multiaddr>()
                    .map_err(|source| ChatError::AddressParse {
                        address: raw,
                        source,
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        if addresses.is_empty() {
            return Err(ChatError::PeerNotFound(*target));
        }
        debug!(peer_id = ?target, count = addresses.len(), "resolved from DHT");
        Ok(addresses)
    }
}

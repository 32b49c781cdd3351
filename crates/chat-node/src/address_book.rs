use async_trait::async_trait;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Previously learned addresses for a peer, in the order they were learned.
#[async_trait]
pub trait AddressBook: Send + Sync {
    async fn get(&self, peer: &PeerId) -> Vec<Multiaddr>;
}

/// Process-wide address cache filled by the node event loop.
#[derive(Clone, Default)]
pub struct MemoryAddressBook {
    entries: Arc<RwLock<HashMap<PeerId, Vec<Multiaddr>>>>,
}

impl MemoryAddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `addr` unless it is already known. A trailing `/p2p/<peer>`
    /// component is stripped first so the same transport address is never
    /// stored twice.
    pub async fn add(&self, peer: PeerId, addr: Multiaddr) -> bool {
        let addr = without_peer_suffix(addr);
        let mut entries = self.entries.write().await;
        let known = entries.entry(peer).or_default();
        if known.contains(&addr) {
            return false;
        }
        known.push(addr);
        true
    }

    pub async fn peer_count(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl AddressBook for MemoryAddressBook {
    async fn get(&self, peer: &PeerId) -> Vec<Multiaddr> {
        self.entries
            .read()
            .await
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }
}

fn without_peer_suffix(mut addr: Multiaddr) -> Multiaddr {
    if matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
        addr.pop();
    }
    addr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keeps_insertion_order_without_duplicates() {
        let book = MemoryAddressBook::new();
        let peer = PeerId::random();
        let first: Multiaddr = "/ip6/::1/tcp/4001".parse().unwrap();
        let second: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();

        assert!(book.add(peer, first.clone()).await);
        assert!(book.add(peer, second.clone()).await);
        assert!(!book.add(peer, first.clone()).await);

        assert_eq!(book.get(&peer).await, vec![first, second]);
        assert_eq!(book.peer_count().await, 1);
    }

    #[tokio::test]
    async fn strips_peer_suffix() {
        let book = MemoryAddressBook::new();
        let peer = PeerId::random();
        let bare: Multiaddr = "/ip4/198.51.100.7/tcp/4001".parse().unwrap();
        let full = bare.clone().with(Protocol::P2p(peer));

        assert!(book.add(peer, full).await);
        assert!(!book.add(peer, bare.clone()).await);
        assert_eq!(book.get(&peer).await, vec![bare]);
    }

    #[tokio::test]
    async fn unknown_peer_is_empty() {
        let book = MemoryAddressBook::new();
        assert!(book.get(&PeerId::random()).await.is_empty());
    }
}

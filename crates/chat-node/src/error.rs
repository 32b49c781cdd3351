use crate::frame::Status;
use libp2p::{multiaddr, PeerId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

/// Failures surfaced by address resolution and the messaging session.
///
/// Nothing in the core retries; every variant reaches the caller of
/// `resolve` or `send` untouched.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Neither the address book nor the DHT knows the peer.
    #[error("peer {0} not found")]
    PeerNotFound(PeerId),

    /// The DHT handed back an address string that is not a valid multiaddr.
    #[error("invalid address {address:?}")]
    AddressParse {
        address: String,
        #[source]
        source: multiaddr::Error,
    },

    /// No connection could be established to any candidate address.
    #[error("failed to dial {peer}: {reason}")]
    Dial { peer: PeerId, reason: String },

    /// The request went out but no acknowledgment arrived in time.
    #[error("request to {0} timed out")]
    Timeout(PeerId),

    /// The remote answered with a non-success status.
    #[error("{peer} rejected message with status {status}")]
    Rejected { peer: PeerId, status: Status },

    #[error("node event loop stopped")]
    NodeStopped,

    #[error("configuration error: {0}")]
    Config(String),
}

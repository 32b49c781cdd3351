use crate::error::{ChatError, Result};
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};

/// The peer a chat is addressed to, as typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTarget {
    pub peer_id: PeerId,
    /// Transport address given alongside the id, if the input was a
    /// `/.../p2p/<id>` multiaddr.
    pub address: Option<Multiaddr>,
}

impl ChatTarget {
    /// Accepts either a base58 peer id or a multiaddr ending in
    /// `/p2p/<peer id>`. The peer id is used exactly as given.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ChatError::Config("Invalid PeerId".to_string()));
        }

        if !input.starts_with('/') {
            let peer_id = input
                .parse::<PeerId>()
                .map_err(|e| ChatError::Config(format!("invalid peer id {input:?}: {e}")))?;
            return Ok(Self {
                peer_id,
                address: None,
            });
        }

        let mut address: Multiaddr = input.parse().map_err(|source| ChatError::AddressParse {
            address: input.to_string(),
            source,
        })?;
        match address.pop() {
            Some(Protocol::P2p(peer_id)) => Ok(Self {
                peer_id,
                address: (!address.is_empty()).then_some(address),
            }),
            _ => Err(ChatError::Config(format!(
                "{input:?} does not end in /p2p/<peer id>"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_is_a_config_error() {
        assert!(matches!(ChatTarget::parse("  \n"), Err(ChatError::Config(_))));
    }

    #[test]
    fn bare_peer_id() {
        let peer = PeerId::random();
        let target = ChatTarget::parse(&format!("{peer}\n")).unwrap();
        assert_eq!(target.peer_id, peer);
        assert_eq!(target.address, None);
    }

    #[test]
    fn multiaddr_with_peer_suffix() {
        let peer = PeerId::random();
        let target = ChatTarget::parse(&format!("/ip4/203.0.113.5/tcp/4001/p2p/{peer}")).unwrap();
        assert_eq!(target.peer_id, peer);
        assert_eq!(
            target.address,
            Some("/ip4/203.0.113.5/tcp/4001".parse().unwrap())
        );
    }

    #[test]
    fn multiaddr_without_peer_is_rejected() {
        assert!(matches!(
            ChatTarget::parse("/ip4/203.0.113.5/tcp/4001"),
            Err(ChatError::Config(_))
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(ChatTarget::parse("not-a-peer").is_err());
    }
}

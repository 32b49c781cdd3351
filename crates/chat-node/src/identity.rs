use anyhow::{anyhow, Result};
use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;

/// The node's ed25519 keypair and the peer id derived from it.
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: Keypair,
    pub peer_id: PeerId,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate_ed25519())
    }

    pub fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    pub fn from_keypair_bytes(bytes: &[u8]) -> Result<Self> {
        let keypair =
            Keypair::from_protobuf_encoding(bytes).map_err(|e| anyhow!("decode keypair: {e}"))?;
        Ok(Self::from_keypair(keypair))
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn to_keypair_bytes(&self) -> Result<Vec<u8>> {
        self.keypair
            .to_protobuf_encoding()
            .map_err(|e| anyhow!("encode keypair: {e}"))
    }
}

impl Default for NodeIdentity {
    fn default() -> Self {
        Self::generate()
    }
}

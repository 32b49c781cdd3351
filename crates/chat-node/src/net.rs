use crate::frame::{ChatCodec, RequestFrame, ResponseFrame, CHAT_PROTOCOL};
use crate::identity::NodeIdentity;
use anyhow::{anyhow, Result};
use futures::future::Either;
use libp2p::core::{muxing::StreamMuxerBox, transport::Boxed, upgrade::Version};
use libp2p::request_response::ProtocolSupport;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{
    dns, identify, kad, noise, ping, quic, request_response, tcp, yamux, Multiaddr, PeerId,
    StreamProtocol, Transport,
};
use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;

pub const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/ipfs/kad/1.0.0");
pub const IDENTIFY_PROTOCOL: &str = "/p2p-chat/0.1.0";

/// Public IPFS bootstrap peers; they speak the same Kademlia protocol.
pub const DEFAULT_BOOTSTRAP: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

#[derive(Clone)]
pub struct NodeConfig {
    pub listen_addrs: Vec<Multiaddr>,
    pub quic_listen_addr: Option<Multiaddr>,
    pub bootstrap: Vec<Multiaddr>,
    pub metrics_addr: Option<SocketAddr>,
    pub enable_tcp: bool,
    pub enable_quic: bool,
    pub request_timeout: Duration,
    pub kad_query_timeout: Duration,
    /// Answer inbound DHT queries instead of waiting for a confirmed
    /// external address. Off means kad picks the mode itself.
    pub kad_server_mode: bool,
    pub idle_connection_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let port: u16 = rand::thread_rng().gen_range(10_000..60_000);
        Self {
            listen_addrs: vec![
                format!("/ip6/::/tcp/{port}").parse().expect("valid addr"),
                format!("/ip4/0.0.0.0/tcp/{port}").parse().expect("valid addr"),
            ],
            quic_listen_addr: Some(
                format!("/ip4/0.0.0.0/udp/{port}/quic-v1")
                    .parse()
                    .expect("valid addr"),
            ),
            bootstrap: DEFAULT_BOOTSTRAP
                .iter()
                .map(|addr| addr.parse().expect("valid bootstrap addr"))
                .collect(),
            metrics_addr: None,
            enable_tcp: true,
            enable_quic: false,
            request_timeout: Duration::from_secs(30),
            kad_query_timeout: Duration::from_secs(60),
            kad_server_mode: true,
            idle_connection_timeout: Duration::from_secs(60),
        }
    }
}

impl NodeConfig {
    /// Loopback-only TCP node with no bootstrap peers.
    pub fn local() -> Self {
        Self {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/0".parse().expect("valid addr")],
            quic_listen_addr: None,
            bootstrap: Vec::new(),
            ..Self::default()
        }
    }
}

pub fn build_transport(
    identity: &NodeIdentity,
    config: &NodeConfig,
) -> Result<Boxed<(PeerId, StreamMuxerBox)>> {
    let mut transport: Option<Boxed<(PeerId, StreamMuxerBox)>> = None;

    if config.enable_tcp {
        let tcp_transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(Version::V1Lazy)
            .authenticate(noise::Config::new(identity.keypair())?)
            .multiplex(yamux::Config::default())
            .map(|(peer, muxer), _| (peer, StreamMuxerBox::new(muxer)))
            .boxed();
        transport = Some(tcp_transport);
    }

    if config.enable_quic {
        let quic_transport = quic::tokio::Transport::new(quic::Config::new(identity.keypair()))
            .map(|(peer, muxer), _| (peer, StreamMuxerBox::new(muxer)))
            .boxed();
        transport = Some(match transport {
            Some(existing) => existing
                .or_transport(quic_transport)
                .map(|output, _| match output {
                    Either::Left(output) | Either::Right(output) => output,
                })
                .boxed(),
            None => quic_transport,
        });
    }

    let transport = transport.ok_or_else(|| anyhow!("no transports enabled"))?;
    let transport = dns::tokio::Transport::system(transport)?;
    Ok(transport.boxed())
}

pub enum NodeEvent {
    Identify(identify::Event),
    Ping(ping::Event),
    Kad(kad::Event),
    RequestResponse(request_response::Event<RequestFrame, ResponseFrame>),
}

impl From<identify::Event> for NodeEvent {
    fn from(event: identify::Event) -> Self {
        Self::Identify(event)
    }
}

impl From<ping::Event> for NodeEvent {
    fn from(event: ping::Event) -> Self {
        Self::Ping(event)
    }
}

impl From<kad::Event> for NodeEvent {
    fn from(event: kad::Event) -> Self {
        Self::Kad(event)
    }
}

impl From<request_response::Event<RequestFrame, ResponseFrame>> for NodeEvent {
    fn from(event: request_response::Event<RequestFrame, ResponseFrame>) -> Self {
        Self::RequestResponse(event)
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "NodeEvent", prelude = "libp2p::swarm::derive_prelude")]
pub struct NodeBehaviour {
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub kad: kad::Behaviour<kad::store::MemoryStore>,
    pub request_response: request_response::Behaviour<ChatCodec>,
}

pub fn build_behaviour(config: &NodeConfig, identity: &NodeIdentity) -> Result<NodeBehaviour> {
    let identify_config = identify::Config::new(IDENTIFY_PROTOCOL.into(), identity.public_key());
    let ping_config = ping::Config::new().with_interval(Duration::from_secs(30));

    let store = kad::store::MemoryStore::new(identity.peer_id);
    let mut kad_config = kad::Config::new(KAD_PROTOCOL);
    kad_config.set_query_timeout(config.kad_query_timeout);
    let mut kad = kad::Behaviour::with_config(identity.peer_id, store, kad_config);
    if config.kad_server_mode {
        kad.set_mode(Some(kad::Mode::Server));
    }

    let request_response = request_response::Behaviour::with_codec(
        ChatCodec,
        [(CHAT_PROTOCOL, ProtocolSupport::Full)],
        request_response::Config::default().with_request_timeout(config.request_timeout),
    );

    Ok(NodeBehaviour {
        identify: identify::Behaviour::new(identify_config),
        ping: ping::Behaviour::new(ping_config),
        kad,
        request_response,
    })
}

/// Splits `/.../p2p/<id>` into the peer id and the address in front of it.
pub fn split_peer_addr(addr: &Multiaddr) -> Result<(PeerId, Multiaddr)> {
    let mut transport_addr = addr.clone();
    match transport_addr.pop() {
        Some(libp2p::multiaddr::Protocol::P2p(peer_id)) => Ok((peer_id, transport_addr)),
        _ => Err(anyhow!("{addr} does not end in /p2p/<peer id>")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bootstrap_addresses_carry_peer_ids() {
        let config = NodeConfig::default();
        assert_eq!(config.bootstrap.len(), DEFAULT_BOOTSTRAP.len());
        for addr in &config.bootstrap {
            split_peer_addr(addr).unwrap();
        }
    }

    #[test]
    fn default_listens_on_one_port_for_both_families() {
        let config = NodeConfig::default();
        let ports: Vec<String> = config
            .listen_addrs
            .iter()
            .map(|addr| addr.to_string().rsplit('/').next().unwrap().to_string())
            .collect();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0], ports[1]);
    }

    #[test]
    fn kad_serves_queries_by_default() {
        let config = NodeConfig::local();
        let behaviour = build_behaviour(&config, &NodeIdentity::generate()).unwrap();
        assert_eq!(behaviour.kad.mode(), kad::Mode::Server);
    }

    #[test]
    fn split_rejects_bare_transport_addr() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert!(split_peer_addr(&addr).is_err());
    }
}

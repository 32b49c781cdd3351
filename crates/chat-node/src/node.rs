use crate::address_book::MemoryAddressBook;
use crate::error::{ChatError, Result as ChatResult};
use crate::frame::{RequestFrame, ResponseFrame};
use crate::handler::{InboundMessage, LoggingHandler, RequestHandler};
use crate::identity::NodeIdentity;
use crate::locator::{PeerAddresses, PeerLocator};
use crate::metrics::NodeMetrics;
use crate::net::{self, NodeConfig, NodeEvent};
use crate::resolver::PeerResolver;
use crate::session::{ChatSession, Dialer};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{identify, kad, ping, request_response, Multiaddr, PeerId, Swarm};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<ChatResult<T>>;

enum Command {
    Dial {
        peer: PeerId,
        addresses: Vec<Multiaddr>,
        reply: Reply<()>,
    },
    Request {
        peer: PeerId,
        frame: RequestFrame,
        reply: Reply<ResponseFrame>,
    },
    FindClosestPeers {
        target: PeerId,
        k: usize,
        reply: Reply<Vec<PeerAddresses>>,
    },
    ListenAddrs {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
}

/// Owns the swarm and drives it; everything else reaches it through a
/// [`NodeHandle`].
pub struct Node {
    swarm: Swarm<net::NodeBehaviour>,
    metrics: Arc<NodeMetrics>,
    identity: NodeIdentity,
    metrics_handle: Option<JoinHandle<()>>,
    address_book: MemoryAddressBook,
    handler: Arc<dyn RequestHandler>,
    inbound_tx: broadcast::Sender<InboundMessage>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    pending_dials: PendingDials,
    pending_requests: HashMap<request_response::OutboundRequestId, Reply<ResponseFrame>>,
    pending_lookups: HashMap<kad::QueryId, (usize, Reply<Vec<PeerAddresses>>)>,
}

impl Node {
    pub async fn new(config: NodeConfig, identity: NodeIdentity) -> Result<(Self, NodeHandle)> {
        let metrics = Arc::new(NodeMetrics::new()?);
        let transport = net::build_transport(&identity, &config)?;
        let behaviour = net::build_behaviour(&config, &identity)?;
        let swarm_config = libp2p::swarm::Config::with_tokio_executor()
            .with_idle_connection_timeout(config.idle_connection_timeout);
        let mut swarm = Swarm::new(transport, behaviour, identity.peer_id, swarm_config);

        let quic_addr = config
            .quic_listen_addr
            .iter()
            .filter(|_| config.enable_quic);
        let mut listening = 0;
        for addr in config.listen_addrs.iter().chain(quic_addr) {
            match swarm.listen_on(addr.clone()) {
                Ok(_) => listening += 1,
                Err(e) => warn!(?addr, ?e, "cannot listen"),
            }
        }
        if listening == 0 {
            return Err(anyhow!("no listen address could be bound"));
        }

        for addr in &config.bootstrap {
            match net::split_peer_addr(addr) {
                Ok((peer_id, transport_addr)) => {
                    swarm.behaviour_mut().kad.add_address(&peer_id, transport_addr);
                }
                Err(e) => warn!(?e, "skipping bootstrap address"),
            }
        }
        if !config.bootstrap.is_empty() {
            if let Err(e) = swarm.behaviour_mut().kad.bootstrap() {
                warn!(?e, "kad bootstrap");
            }
        }

        let metrics_handle = config
            .metrics_addr
            .map(|addr| metrics.clone().spawn_server(addr))
            .transpose()?;

        let inbound_tx = broadcast::channel(1024).0;
        let handler = Arc::new(LoggingHandler::new(inbound_tx.clone()));
        let address_book = MemoryAddressBook::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let handle = NodeHandle {
            peer_id: identity.peer_id,
            command_tx,
            address_book: address_book.clone(),
        };
        let node = Self {
            swarm,
            metrics,
            identity,
            metrics_handle,
            address_book,
            handler,
            inbound_tx,
            command_rx,
            pending_dials: PendingDials::default(),
            pending_requests: HashMap::new(),
            pending_lookups: HashMap::new(),
        };
        Ok((node, handle))
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id
    }

    /// Messages accepted by the default handler.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.inbound_tx.subscribe()
    }

    pub fn inbound_sender(&self) -> broadcast::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    /// Replaces the default [`LoggingHandler`].
    pub fn set_handler(&mut self, handler: Arc<dyn RequestHandler>) {
        self.handler = handler;
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                event = self.swarm.next() => {
                    match event {
                        Some(event) => self.handle_swarm_event(event).await,
                        None => return Err(anyhow!("swarm terminated")),
                    }
                }
                Some(command) = self.command_rx.recv() => {
                    self.handle_command(command);
                }
            }
        }
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<NodeEvent>) {
        match event {
            SwarmEvent::Behaviour(event) => self.handle_event(event).await,
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                info!(?peer_id, "connection established");
                self.metrics.peers_gauge.inc();
                if endpoint.is_dialer() {
                    self.address_book
                        .add(peer_id, endpoint.get_remote_address().clone())
                        .await;
                }
                for reply in self.pending_dials.connected(&peer_id) {
                    let _ = reply.send(Ok(()));
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                info!(?peer_id, "connection closed");
                self.metrics.peers_gauge.dec();
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(?address, "listening");
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                warn!(?peer_id, ?error, "outgoing connection error");
                let Some(peer_id) = peer_id else { return };
                let reason = error.to_string();
                for reply in self.pending_dials.failed(&peer_id, connection_id) {
                    self.metrics.send_failures.inc();
                    let _ = reply.send(Err(ChatError::Dial {
                        peer: peer_id,
                        reason: reason.clone(),
                    }));
                }
            }
            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                warn!(?send_back_addr, ?error, "incoming connection error");
            }
            _ => {}
        }
    }

    async fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                debug!(?peer_id, protocols = ?info.protocols, "identify info");
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kad
                        .add_address(&peer_id, addr.clone());
                    self.address_book.add(peer_id, addr).await;
                }
            }
            NodeEvent::Identify(_) => {}
            NodeEvent::Ping(ping::Event { peer, result, .. }) => match result {
                Ok(rtt) => debug!(?peer, ?rtt, "ping"),
                Err(e) => warn!(?peer, ?e, "ping failed"),
            },
            NodeEvent::Kad(kad::Event::OutboundQueryProgressed {
                id,
                result: kad::QueryResult::GetClosestPeers(result),
                ..
            }) => self.finish_lookup(id, result),
            NodeEvent::Kad(event) => {
                debug!(?event, "kad event");
            }
            NodeEvent::RequestResponse(event) => self.handle_request_response(event),
        }
    }

    fn handle_request_response(
        &mut self,
        event: request_response::Event<RequestFrame, ResponseFrame>,
    ) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    self.metrics.messages_received.inc();
                    let response = self.handler.handle(&peer, request);
                    if self
                        .swarm
                        .behaviour_mut()
                        .request_response
                        .send_response(channel, response)
                        .is_err()
                    {
                        warn!(?peer, "connection closed before ack was sent");
                    }
                }
                request_response::Message::Response {
                    request_id,
                    response,
                    ..
                } => {
                    if let Some(reply) = self.pending_requests.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                self.metrics.send_failures.inc();
                warn!(?peer, ?error, "chat request failed");
                if let Some(reply) = self.pending_requests.remove(&request_id) {
                    let err = match error {
                        request_response::OutboundFailure::Timeout => ChatError::Timeout(peer),
                        other => ChatError::Dial {
                            peer,
                            reason: other.to_string(),
                        },
                    };
                    let _ = reply.send(Err(err));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                warn!(?peer, ?error, "inbound chat request failed");
            }
            request_response::Event::ResponseSent { peer, .. } => {
                debug!(?peer, "ack sent");
            }
        }
    }

    fn finish_lookup(
        &mut self,
        id: kad::QueryId,
        result: Result<kad::GetClosestPeersOk, kad::GetClosestPeersError>,
    ) {
        let Some((k, reply)) = self.pending_lookups.remove(&id) else {
            return;
        };
        let peers = match result {
            Ok(kad::GetClosestPeersOk { peers, .. }) => peers,
            Err(kad::GetClosestPeersError::Timeout { peers, .. }) => {
                warn!(?id, "closest peer query timed out");
                peers
            }
        };
        let found = peers
            .into_iter()
            .take(k)
            .map(|info| PeerAddresses::new(info.peer_id, info.addrs.iter().map(ToString::to_string)))
            .collect();
        let _ = reply.send(Ok(found));
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial {
                peer,
                addresses,
                reply,
            } => {
                if self.swarm.is_connected(&peer) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                let Some(reply) = self.pending_dials.join(&peer, reply) else {
                    return;
                };
                let opts = DialOpts::peer_id(peer)
                    .addresses(addresses)
                    .condition(PeerCondition::Disconnected)
                    .build();
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => self.pending_dials.insert(peer, connection_id, reply),
                    Err(e) => {
                        let _ = reply.send(Err(ChatError::Dial {
                            peer,
                            reason: e.to_string(),
                        }));
                    }
                }
            }
            Command::Request { peer, frame, reply } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .request_response
                    .send_request(&peer, frame);
                self.metrics.messages_sent.inc();
                self.pending_requests.insert(request_id, reply);
            }
            Command::FindClosestPeers { target, k, reply } => {
                self.metrics.dht_lookups.inc();
                let query_id = self.swarm.behaviour_mut().kad.get_closest_peers(target);
                self.pending_lookups.insert(query_id, (k, reply));
            }
            Command::ListenAddrs { reply } => {
                let _ = reply.send(self.swarm.listeners().cloned().collect());
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(handle) = self.metrics_handle.take() {
            handle.abort();
        }
    }
}

/// Session dials waiting for a connection, keyed by peer. Only the
/// connection the session asked for can fail them; any connection to the
/// peer completes them.
#[derive(Default)]
struct PendingDials {
    dials: HashMap<PeerId, (ConnectionId, Vec<Reply<()>>)>,
}

impl PendingDials {
    /// Queues behind a dial already in progress, or hands the reply back.
    fn join(&mut self, peer: &PeerId, reply: Reply<()>) -> Option<Reply<()>> {
        match self.dials.get_mut(peer) {
            Some((_, waiters)) => {
                waiters.push(reply);
                None
            }
            None => Some(reply),
        }
    }

    fn insert(&mut self, peer: PeerId, connection_id: ConnectionId, reply: Reply<()>) {
        self.dials.insert(peer, (connection_id, vec![reply]));
    }

    fn connected(&mut self, peer: &PeerId) -> Vec<Reply<()>> {
        self.dials
            .remove(peer)
            .map(|(_, waiters)| waiters)
            .unwrap_or_default()
    }

    fn failed(&mut self, peer: &PeerId, connection_id: ConnectionId) -> Vec<Reply<()>> {
        match self.dials.get(peer) {
            Some((pending, _)) if *pending == connection_id => self.connected(peer),
            _ => Vec::new(),
        }
    }
}

/// Cheap, cloneable access to a running [`Node`].
#[derive(Clone)]
pub struct NodeHandle {
    peer_id: PeerId,
    command_tx: mpsc::UnboundedSender<Command>,
    address_book: MemoryAddressBook,
}

impl NodeHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn address_book(&self) -> MemoryAddressBook {
        self.address_book.clone()
    }

    /// A messaging session wired to this node's address book, DHT and
    /// transport.
    pub fn session(&self) -> ChatSession {
        let resolver = PeerResolver::new(Arc::new(self.address_book()), Arc::new(self.clone()));
        ChatSession::new(resolver, Arc::new(self.clone()))
    }

    pub async fn listen_addrs(&self) -> ChatResult<Vec<Multiaddr>> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(Command::ListenAddrs { reply })
            .map_err(|_| ChatError::NodeStopped)?;
        rx.await.map_err(|_| ChatError::NodeStopped)
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> ChatResult<T> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(command(reply))
            .map_err(|_| ChatError::NodeStopped)?;
        rx.await.map_err(|_| ChatError::NodeStopped)?
    }
}

#[async_trait]
impl Dialer for NodeHandle {
    async fn dial(&self, peer: &PeerId, addresses: Vec<Multiaddr>) -> ChatResult<()> {
        let peer = *peer;
        self.call(|reply| Command::Dial {
            peer,
            addresses,
            reply,
        })
        .await
    }

    async fn request(&self, peer: &PeerId, frame: RequestFrame) -> ChatResult<ResponseFrame> {
        let peer = *peer;
        self.call(|reply| Command::Request { peer, frame, reply })
            .await
    }
}

#[async_trait]
impl PeerLocator for NodeHandle {
    async fn find_closest_peers(&self, target: &PeerId, k: usize) -> ChatResult<Vec<PeerAddresses>> {
        let target = *target;
        self.call(|reply| Command::FindClosestPeers { target, k, reply })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrelated_dial_failure_leaves_session_dial_pending() {
        let mut pending = PendingDials::default();
        let peer = PeerId::random();
        let (reply, mut rx) = oneshot::channel();
        pending.insert(peer, ConnectionId::new_unchecked(1), reply);

        assert!(pending.failed(&peer, ConnectionId::new_unchecked(2)).is_empty());
        assert!(rx.try_recv().is_err());

        let waiters = pending.failed(&peer, ConnectionId::new_unchecked(1));
        assert_eq!(waiters.len(), 1);
        assert!(pending.connected(&peer).is_empty());
    }

    #[test]
    fn second_dial_waits_on_the_first() {
        let mut pending = PendingDials::default();
        let peer = PeerId::random();
        let (first, _rx1) = oneshot::channel();
        let (second, _rx2) = oneshot::channel();

        let first = pending.join(&peer, first).unwrap();
        pending.insert(peer, ConnectionId::new_unchecked(7), first);
        assert!(pending.join(&peer, second).is_none());

        assert_eq!(pending.connected(&peer).len(), 2);
    }

    #[tokio::test]
    async fn stopped_node_reports_node_stopped() {
        let (node, handle) = Node::new(NodeConfig::local(), NodeIdentity::generate())
            .await
            .unwrap();
        drop(node);

        let err = handle
            .request(&PeerId::random(), RequestFrame::new("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NodeStopped));
    }

    #[tokio::test]
    async fn empty_dht_finds_nobody() {
        let (node, handle) = Node::new(NodeConfig::local(), NodeIdentity::generate())
            .await
            .unwrap();
        let task = node.spawn();

        let found = handle.find_closest_peers(&PeerId::random(), 1).await.unwrap();
        assert!(found.is_empty());

        let err = handle.session().send(&PeerId::random(), "hello").await.unwrap_err();
        assert!(matches!(err, ChatError::PeerNotFound(_)));
        task.abort();
    }
}

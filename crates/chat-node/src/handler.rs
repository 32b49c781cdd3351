use crate::frame::{RequestFrame, ResponseFrame, Status};
use libp2p::PeerId;
use std::collections::HashSet;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A chat message delivered by a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub from: PeerId,
    pub text: String,
}

/// Receiver side of the chat protocol, invoked once per inbound request.
///
/// Implementations may run concurrently for different peers and must not
/// block.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, source: &PeerId, request: RequestFrame) -> ResponseFrame;
}

/// Logs every message, republishes it to subscribers and acknowledges it.
pub struct LoggingHandler {
    inbound_tx: broadcast::Sender<InboundMessage>,
}

impl LoggingHandler {
    pub fn new(inbound_tx: broadcast::Sender<InboundMessage>) -> Self {
        Self { inbound_tx }
    }
}

impl RequestHandler for LoggingHandler {
    fn handle(&self, source: &PeerId, request: RequestFrame) -> ResponseFrame {
        let text = String::from_utf8_lossy(request.body()).into_owned();
        info!(from = ?source, "received msg:{text}");
        // no subscribers is fine
        let _ = self.inbound_tx.send(InboundMessage {
            from: *source,
            text,
        });
        ResponseFrame::ok()
    }
}

/// Decides whether a sender may deliver messages.
pub trait SenderPolicy: Send + Sync {
    fn allows(&self, source: &PeerId) -> bool;
}

pub struct AllowAll;

impl SenderPolicy for AllowAll {
    fn allows(&self, _source: &PeerId) -> bool {
        true
    }
}

pub struct AllowList {
    peers: HashSet<PeerId>,
}

impl AllowList {
    pub fn new(peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            peers: peers.into_iter().collect(),
        }
    }
}

impl SenderPolicy for AllowList {
    fn allows(&self, source: &PeerId) -> bool {
        self.peers.contains(source)
    }
}

/// Puts a [`SenderPolicy`] in front of another handler. Refused senders get
/// an empty `403` and the inner handler never sees the request.
pub struct GatedHandler<H, P> {
    inner: H,
    policy: P,
}

impl<H, P> GatedHandler<H, P> {
    pub fn new(inner: H, policy: P) -> Self {
        Self { inner, policy }
    }
}

impl<H, P> RequestHandler for GatedHandler<H, P>
where
    H: RequestHandler,
    P: SenderPolicy,
{
    fn handle(&self, source: &PeerId, request: RequestFrame) -> ResponseFrame {
        if !self.policy.allows(source) {
            warn!(from = ?source, "dropping message from unauthorised peer");
            return ResponseFrame::with_status(Status::FORBIDDEN);
        }
        self.inner.handle(source, request)
    }
}
